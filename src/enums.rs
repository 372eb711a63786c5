/// Numeric element type of a volume buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    F16,
    F32,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size_of(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 | ElementType::F16 => 2,
            ElementType::F32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F16 | ElementType::F32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Modality {
    CT,
    MR,
    PT,
    NM,
    #[default]
    Other,
}

impl Modality {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "CT" => Modality::CT,
            "MR" => Modality::MR,
            "PT" => Modality::PT,
            "NM" => Modality::NM,
            _ => Modality::Other,
        }
    }

    /// Modalities whose stored values are converted to quantitative units
    pub fn is_quantitative(&self) -> bool {
        matches!(self, Modality::PT)
    }
}

/// Order in which frames are submitted for loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameOrder {
    Sequential,
    MiddleOut,
    #[default]
    Interleaved,
}

/// Key used to order the files of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}

/// How decached frames hold their pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStorage {
    /// Entries alias the still-live volume buffer
    SharedView,
    /// Entries own a copy of their frame
    #[default]
    Copied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type_sizes() {
        assert_eq!(ElementType::I8.size_of(), 1);
        assert_eq!(ElementType::F16.size_of(), 2);
        assert_eq!(ElementType::F32.size_of(), 4);
        assert!(ElementType::F16.is_float());
        assert!(!ElementType::U16.is_float());
    }

    #[test]
    fn test_modality_codes() {
        assert_eq!(Modality::from_code("PT"), Modality::PT);
        assert_eq!(Modality::from_code("CT "), Modality::CT);
        assert_eq!(Modality::from_code("US"), Modality::Other);
        assert!(Modality::PT.is_quantitative());
        assert!(!Modality::CT.is_quantitative());
    }
}
