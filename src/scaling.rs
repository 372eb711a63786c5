//! Per-frame linear rescaling into physical units
//!
//! Stored values are `(raw * slope + intercept) * suv_bw`, where `suv_bw` is
//! only present for quantitative PT frames. The record is computed once per
//! volume and never changes afterwards.

use log::debug;

use crate::metadata::{FrameMetadata, MetadataProvider, PatientSex, PetMetadata};
use crate::volume::FrameId;

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScaling {
    pub slope: f64,
    pub intercept: f64,
    /// SUV body-weight factor, for PT frames in Bq/ml
    pub suv_bw: Option<f64>,
}

impl Default for FrameScaling {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl FrameScaling {
    pub const IDENTITY: FrameScaling = FrameScaling {
        slope: 1.0,
        intercept: 0.0,
        suv_bw: None,
    };

    pub fn from_metadata(metadata: Option<&FrameMetadata>) -> Self {
        let Some(metadata) = metadata else {
            return Self::IDENTITY;
        };
        Self {
            slope: metadata.rescale_slope.filter(|s| s.is_finite() && *s != 0.0).unwrap_or(1.0),
            intercept: metadata.rescale_intercept.filter(|i| i.is_finite()).unwrap_or(0.0),
            suv_bw: metadata
                .pet
                .as_ref()
                .and_then(|pet| SuvFactors::compute(pet))
                .map(|factors| factors.body_weight),
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    #[inline]
    pub fn apply(&self, raw: f64) -> f64 {
        (raw * self.slope + self.intercept) * self.suv_bw.unwrap_or(1.0)
    }

    /// Recover the raw stored value from a scaled one
    #[inline]
    pub fn invert(&self, scaled: f64) -> f64 {
        (scaled / self.suv_bw.unwrap_or(1.0) - self.intercept) / self.slope
    }
}

/// Alternative SUV normalisations relative to body weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuvRatios {
    /// suv_lbm / suv_bw
    pub lean_body_mass: Option<f64>,
    /// suv_bsa / suv_bw
    pub body_surface_area: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingRecord {
    frames: Vec<FrameScaling>,
    ratios: Option<SuvRatios>,
}

impl ScalingRecord {
    /// Compute per-frame scaling for `frame_ids`; the SUV ratios come from the
    /// first frame that yields SUV factors and hold for the whole volume.
    pub fn compute(frame_ids: &[FrameId], metadata: &dyn MetadataProvider) -> Self {
        let mut ratios = None;
        let frames = frame_ids
            .iter()
            .map(|frame_id| {
                let frame_metadata = metadata.frame_metadata(frame_id);
                if ratios.is_none() {
                    ratios = frame_metadata
                        .as_ref()
                        .and_then(|m| m.pet.as_ref())
                        .and_then(SuvFactors::compute)
                        .map(|factors| factors.ratios());
                }
                FrameScaling::from_metadata(frame_metadata.as_ref())
            })
            .collect::<Vec<_>>();

        debug!(
            "scaling computed for {} frames, quantitative={}",
            frames.len(),
            ratios.is_some()
        );
        Self { frames, ratios }
    }

    pub fn identity(num_frames: usize) -> Self {
        Self {
            frames: vec![FrameScaling::IDENTITY; num_frames],
            ratios: None,
        }
    }

    pub fn frame(&self, index: usize) -> FrameScaling {
        self.frames.get(index).copied().unwrap_or_default()
    }

    pub fn ratios(&self) -> Option<SuvRatios> {
        self.ratios
    }

    /// Whether stored values are fractional quantitative units
    pub fn is_quantitative(&self) -> bool {
        self.frames.iter().any(|frame| frame.suv_bw.is_some())
    }
}

struct SuvFactors {
    body_weight: f64,
    lean_body_mass: Option<f64>,
    body_surface_area: Option<f64>,
}

impl SuvFactors {
    fn compute(pet: &PetMetadata) -> Option<Self> {
        if !pet
            .units
            .as_deref()
            .is_some_and(|units| units.eq_ignore_ascii_case("BQML"))
        {
            return None;
        }
        let weight_kg = pet.patient_weight_kg.filter(|w| *w > 0.0)?;
        let dose = Self::decayed_dose(pet)?;

        let lean_body_mass = pet
            .patient_size_m
            .filter(|h| *h > 0.0)
            .zip(pet.patient_sex)
            .map(|(height_m, sex)| {
                let height_cm = height_m * 100.0;
                let ratio = weight_kg / height_cm;
                match sex {
                    PatientSex::Male => 1.10 * weight_kg - 128.0 * ratio * ratio,
                    PatientSex::Female => 1.07 * weight_kg - 148.0 * ratio * ratio,
                }
            })
            .filter(|lbm| *lbm > 0.0)
            .map(|lbm| lbm * 1000.0 / dose);

        let body_surface_area = pet.patient_size_m.filter(|h| *h > 0.0).map(|height_m| {
            let bsa_m2 = weight_kg.powf(0.425) * (height_m * 100.0).powf(0.725) * 0.007184;
            bsa_m2 * 10_000.0 / dose
        });

        Some(Self {
            body_weight: weight_kg * 1000.0 / dose,
            lean_body_mass,
            body_surface_area,
        })
    }

    fn decayed_dose(pet: &PetMetadata) -> Option<f64> {
        let dose = pet.total_dose.filter(|d| *d > 0.0)?;
        match pet.decay_correction.as_deref() {
            Some("ADMIN") => Some(dose),
            Some("START") | None => {
                let half_life = pet.half_life.filter(|h| *h > 0.0)?;
                let injection = pet.injection_time?;
                let scan = pet.series_time.or(pet.acquisition_time)?;
                let mut elapsed = scan - injection;
                if elapsed < 0.0 {
                    elapsed += SECONDS_PER_DAY;
                }
                Some(dose * (-elapsed * std::f64::consts::LN_2 / half_life).exp())
            }
            Some(_) => None,
        }
    }

    fn ratios(&self) -> SuvRatios {
        SuvRatios {
            lean_body_mass: self.lean_body_mass.map(|lbm| lbm / self.body_weight),
            body_surface_area: self.body_surface_area.map(|bsa| bsa / self.body_weight),
        }
    }
}
