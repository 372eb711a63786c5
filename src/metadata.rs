//! Per-frame calibration metadata
//!
//! Every field is optional: providers report what they find and the scaling
//! calculator falls back to identity scaling for the rest.

use std::collections::HashMap;

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;

use crate::enums::Modality;
use crate::volume::FrameId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientSex {
    Male,
    Female,
}

/// Fields needed for standardized uptake value (SUV) scaling of PT frames
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PetMetadata {
    pub units: Option<String>,
    pub decay_correction: Option<String>,
    pub patient_weight_kg: Option<f64>,
    pub patient_size_m: Option<f64>,
    pub patient_sex: Option<PatientSex>,
    /// Radionuclide total dose in Bq
    pub total_dose: Option<f64>,
    /// Radionuclide half life in seconds
    pub half_life: Option<f64>,
    /// Injection time, seconds since midnight
    pub injection_time: Option<f64>,
    /// Series time, seconds since midnight
    pub series_time: Option<f64>,
    /// Acquisition time, seconds since midnight
    pub acquisition_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub modality: Option<Modality>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub pet: Option<PetMetadata>,
}

pub trait MetadataProvider: Send + Sync {
    fn frame_metadata(&self, frame_id: &str) -> Option<FrameMetadata>;
}

/// Metadata kept in a map keyed by frame id
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetadata {
    frames: HashMap<FrameId, FrameMetadata>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame_id: impl Into<FrameId>, metadata: FrameMetadata) {
        self.frames.insert(frame_id.into(), metadata);
    }

    pub fn with_frame(mut self, frame_id: impl Into<FrameId>, metadata: FrameMetadata) -> Self {
        self.insert(frame_id, metadata);
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl MetadataProvider for InMemoryMetadata {
    fn frame_metadata(&self, frame_id: &str) -> Option<FrameMetadata> {
        self.frames.get(frame_id).cloned()
    }
}

/// Metadata read from DICOM data sets
#[derive(Debug, Clone, Default)]
pub struct DicomMetadata {
    inner: InMemoryMetadata,
}

impl DicomMetadata {
    pub fn from_objects<'a>(
        objects: impl IntoIterator<Item = (FrameId, &'a InMemDicomObject)>,
    ) -> Self {
        let mut inner = InMemoryMetadata::new();
        for (frame_id, object) in objects {
            inner.insert(frame_id, Self::read(object));
        }
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn read(object: &InMemDicomObject) -> FrameMetadata {
        let modality = read_string(object, tags::MODALITY).map(|code| Modality::from_code(&code));
        let pet = matches!(modality, Some(Modality::PT)).then(|| Self::read_pet(object));
        FrameMetadata {
            modality,
            rescale_slope: read_float(object, tags::RESCALE_SLOPE),
            rescale_intercept: read_float(object, tags::RESCALE_INTERCEPT),
            pet,
        }
    }

    fn read_pet(object: &InMemDicomObject) -> PetMetadata {
        let radiopharmaceutical = object
            .element(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE)
            .ok()
            .and_then(|element| element.items())
            .and_then(|items| items.first());

        PetMetadata {
            units: read_string(object, tags::UNITS),
            decay_correction: read_string(object, tags::DECAY_CORRECTION),
            patient_weight_kg: read_float(object, tags::PATIENT_WEIGHT),
            patient_size_m: read_float(object, tags::PATIENT_SIZE),
            patient_sex: read_string(object, tags::PATIENT_SEX).and_then(|sex| match sex.as_str() {
                "M" => Some(PatientSex::Male),
                "F" => Some(PatientSex::Female),
                _ => None,
            }),
            total_dose: radiopharmaceutical
                .and_then(|item| read_float(item, tags::RADIONUCLIDE_TOTAL_DOSE)),
            half_life: radiopharmaceutical
                .and_then(|item| read_float(item, tags::RADIONUCLIDE_HALF_LIFE)),
            injection_time: radiopharmaceutical
                .and_then(|item| read_string(item, tags::RADIOPHARMACEUTICAL_START_TIME))
                .and_then(|time| parse_time(&time)),
            series_time: read_string(object, tags::SERIES_TIME).and_then(|time| parse_time(&time)),
            acquisition_time: read_string(object, tags::ACQUISITION_TIME)
                .and_then(|time| parse_time(&time)),
        }
    }
}

impl MetadataProvider for DicomMetadata {
    fn frame_metadata(&self, frame_id: &str) -> Option<FrameMetadata> {
        self.inner.frame_metadata(frame_id)
    }
}

fn read_float(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<f64> {
    object.element(tag).ok()?.to_float64().ok()
}

fn read_string(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    let value = object.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse a DICOM TM value (`HHMMSS.FFFFFF`, `HH:MM:SS` or a prefix of
/// either) into seconds since midnight
pub fn parse_time(value: &str) -> Option<f64> {
    let value: String = value.trim().chars().filter(|&c| c != ':').collect();
    let (whole, fraction) = value.split_once('.').unwrap_or((value.as_str(), ""));
    if whole.len() < 2 || whole.len() > 6 || whole.len() % 2 != 0 {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> Option<f64> {
        match whole.get(range) {
            Some(digits) => digits.parse::<u32>().ok().map(f64::from),
            None => Some(0.0),
        }
    };
    let hours = field(0..2)?;
    let minutes = field(2..4)?;
    let seconds = field(4..6)?;
    let fraction = if fraction.is_empty() {
        0.0
    } else {
        format!("0.{fraction}").parse::<f64>().ok()?
    };
    if hours >= 24.0 || minutes >= 60.0 || seconds >= 61.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds + fraction)
}
