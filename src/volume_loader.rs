use crate::{
    buffer::FrameSlot,
    element::Element,
    enums::SortBy,
    metadata::DicomMetadata,
    task::{FrameError, FrameLoader, FrameTask, write_scaled},
    volume::{FrameId, Volume, VolumeGeometry},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, OpenFileOptions, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use log::{debug, info};
use ndarray::s;
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Missing image dimensions in {0}")]
    MissingDimensions(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

struct SeriesFile {
    path: PathBuf,
    object: FileDicomObject<InMemDicomObject>,
}

/// Builds empty volumes from DICOM series on disk
///
/// Only headers are read here. Pixel data is fetched frame by frame later
/// through [`DicomFileLoader`], using the file path as the frame id.
pub struct VolumeLoader;

impl VolumeLoader {
    /// Create a volume for every `.dcm` file in a directory
    ///
    /// # Errors
    ///
    /// Returns error if no files are found, headers cannot be read or the
    /// frames do not share the same dimensions
    pub fn from_directory<T: Element>(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<(Volume<T>, DicomMetadata), VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::from_file_paths(&paths, sort_by)
    }

    /// Create a volume from file paths, one frame per file
    pub fn from_file_paths<T: Element>(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<(Volume<T>, DicomMetadata), VolumeLoaderError> {
        let mut files = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref().to_path_buf();
                let object = OpenFileOptions::new()
                    .read_until(tags::PIXEL_DATA)
                    .open_file(&path)?;
                Ok::<_, VolumeLoaderError>(SeriesFile { path, object })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if files.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_files(&mut files, sort_by);
        let (rows, columns) = Self::validate_dimensions(&files)?;
        let spacing = Self::get_spacing(&files).ok_or(VolumeLoaderError::MissingSpacing)?;

        let mut geometry = VolumeGeometry::new(rows, columns, spacing);
        if let Some(origin) = Self::get_origin(&files[0].object) {
            geometry.origin = origin;
        }
        if let Some(direction) = Self::get_direction(&files[0].object) {
            geometry.direction = direction;
        }

        let frame_ids: Vec<FrameId> = files
            .iter()
            .map(|file| file.path.to_string_lossy().into_owned())
            .collect();
        let metadata = DicomMetadata::from_objects(
            frame_ids
                .iter()
                .cloned()
                .zip(files.iter().map(|file| &*file.object)),
        );
        info!(
            "series of {} frames ({rows}x{columns}) ready for loading",
            frame_ids.len()
        );

        Ok((Volume::new(frame_ids, geometry), metadata))
    }

    fn get_sort_order(dicom_object: &InMemDicomObject, sort_by: SortBy) -> Option<f32> {
        match sort_by {
            SortBy::ImagePositionPatient => dicom_object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()?
                .to_multi_float32()
                .ok()?
                .get(2)
                .copied(),
            SortBy::TablePosition => dicom_object
                .element(tags::TABLE_POSITION)
                .ok()?
                .to_float32()
                .ok(),
            SortBy::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(|n| n as f32),
            SortBy::None => Some(0.0),
        }
    }

    fn sort_files(files: &mut [SeriesFile], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            files.sort_by(|a, b| {
                let a = Self::get_sort_order(&a.object, sort_by);
                let b = Self::get_sort_order(&b.object, sort_by);
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if matches!(sort_by, SortBy::ImagePositionPatient) {
            files.reverse();
        }
    }

    fn get_dimensions(dicom_object: &InMemDicomObject) -> Option<(usize, usize)> {
        let rows = dicom_object.element(tags::ROWS).ok()?.to_int::<u32>().ok()?;
        let columns = dicom_object
            .element(tags::COLUMNS)
            .ok()?
            .to_int::<u32>()
            .ok()?;
        Some((rows as usize, columns as usize))
    }

    fn validate_dimensions(files: &[SeriesFile]) -> Result<(usize, usize), VolumeLoaderError> {
        let mut dims = files.iter().map(|file| {
            Self::get_dimensions(&file.object)
                .ok_or_else(|| VolumeLoaderError::MissingDimensions(file.path.clone()))
        });
        let first_dim = match dims.next() {
            Some(dim) => dim?,
            None => return Err(VolumeLoaderError::NoValidImages),
        };
        for dim in dims {
            if dim? != first_dim {
                return Err(VolumeLoaderError::InconsistentDimensions);
            }
        }
        Ok(first_dim)
    }

    fn get_spacing(files: &[SeriesFile]) -> Option<(f32, f32, f32)> {
        files.iter().find_map(|file| {
            let pixel_spacing = file
                .object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;

            let slice_thickness = file
                .object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float32()
                .ok()?;

            Some((*pixel_spacing.first()?, *pixel_spacing.get(1)?, slice_thickness))
        })
    }

    fn get_origin(dicom_object: &InMemDicomObject) -> Option<[f32; 3]> {
        let position = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float32()
            .ok()?;
        Some([*position.first()?, *position.get(1)?, *position.get(2)?])
    }

    /// Row, column and normal direction cosines
    fn get_direction(dicom_object: &InMemDicomObject) -> Option<[f32; 9]> {
        let cosines = dicom_object
            .element(tags::IMAGE_ORIENTATION_PATIENT)
            .ok()?
            .to_multi_float32()
            .ok()?;
        if cosines.len() < 6 {
            return None;
        }
        let (r, c) = (&cosines[0..3], &cosines[3..6]);
        let normal = [
            r[1] * c[2] - r[2] * c[1],
            r[2] * c[0] - r[0] * c[2],
            r[0] * c[1] - r[1] * c[0],
        ];
        Some([
            r[0], r[1], r[2], c[0], c[1], c[2], normal[0], normal[1], normal[2],
        ])
    }
}

/// Fetches frames whose id is the path of a single-frame DICOM file
///
/// Stored values are decoded without the modality LUT; rescaling happens
/// through the task's scaling so quantitative factors are applied as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomFileLoader;

impl<T: Element> FrameLoader<T> for DicomFileLoader {
    fn load_frame(&self, task: &FrameTask, slot: &mut FrameSlot<T>) -> Result<(), FrameError> {
        let dicom_object =
            open_file(&task.frame_id).map_err(|err| FrameError::Fetch(err.to_string()))?;
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|err| FrameError::Decode(err.to_string()))?;
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
        let image = pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map_err(|err| FrameError::Decode(err.to_string()))?
            .slice_move(s![0, .., .., 0]);

        let raw: Vec<f32> = image.iter().copied().collect();
        write_scaled(slot, &raw, &task.scaling)?;
        debug!("decoded frame {} from {}", task.frame_index, task.frame_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};

    fn header(instance: i32, z: f32, rows: u16) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from(instance.to_string()),
            ),
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                PrimitiveValue::Strs(
                    ["0".to_string(), "0".to_string(), z.to_string()]
                        .into_iter()
                        .collect(),
                ),
            ),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(4u16)),
        ])
    }

    #[test]
    fn test_sort_order() {
        let object = header(7, -12.5, 4);
        assert_eq!(
            VolumeLoader::get_sort_order(&object, SortBy::InstanceNumber),
            Some(7.0)
        );
        assert_eq!(
            VolumeLoader::get_sort_order(&object, SortBy::ImagePositionPatient),
            Some(-12.5)
        );
        assert_eq!(VolumeLoader::get_sort_order(&object, SortBy::TablePosition), None);
        assert_eq!(VolumeLoader::get_sort_order(&object, SortBy::None), Some(0.0));
    }

    #[test]
    fn test_dimensions_and_origin() {
        let object = header(1, 3.0, 8);
        assert_eq!(VolumeLoader::get_dimensions(&object), Some((8, 4)));
        assert_eq!(VolumeLoader::get_origin(&object), Some([0.0, 0.0, 3.0]));
        assert_eq!(VolumeLoader::get_direction(&object), None);
    }

    #[test]
    fn test_direction_normal() {
        let object = InMemDicomObject::from_element_iter([DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            PrimitiveValue::Strs(
                ["1", "0", "0", "0", "1", "0"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        )]);
        assert_eq!(
            VolumeLoader::get_direction(&object),
            Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
        );
    }

    #[test]
    fn test_empty_directory() {
        let dir = std::env::temp_dir().join(format!("dicom-empty-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let result = VolumeLoader::from_directory::<f32>(&dir, SortBy::InstanceNumber);
        assert!(matches!(result, Err(VolumeLoaderError::NoValidImages)));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_fails_fetch() {
        let volume: Volume<u16> = Volume::new(
            vec!["/nonexistent/frame.dcm".to_string()],
            VolumeGeometry::new(2, 2, (1.0, 1.0, 1.0)),
        );
        let mut slot = volume.buffer().claim(0).unwrap();
        let task = FrameTask {
            frame_id: "/nonexistent/frame.dcm".to_string(),
            frame_index: 0,
            range: slot.range(),
            priority: 0,
            cancel_tag: volume.id(),
            scaling: crate::scaling::FrameScaling::IDENTITY,
            ratios: None,
            generation: 1,
        };
        let err = DicomFileLoader.load_frame(&task, &mut slot).unwrap_err();
        assert!(matches!(err, FrameError::Fetch(_)));
    }
}
