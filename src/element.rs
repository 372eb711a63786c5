use bytemuck::Pod;
use half::f16;

use crate::enums::ElementType;

/// Element types a shared volume buffer can be allocated with
///
/// Conversions from `f64` saturate for integer types and round to the nearest
/// representable value.
pub trait Element: Pod + PartialOrd + Send + Sync + std::fmt::Debug + 'static {
    const ELEMENT_TYPE: ElementType;

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;
}

macro_rules! integer_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$variant;

            #[inline]
            fn from_f64(value: f64) -> Self {
                value.round() as $ty
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

integer_element!(u8, U8);
integer_element!(i8, I8);
integer_element!(u16, U16);
integer_element!(i16, I16);

impl Element for f32 {
    const ELEMENT_TYPE: ElementType = ElementType::F32;

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f16 {
    const ELEMENT_TYPE: ElementType = ElementType::F16;

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_conversion_saturates() {
        assert_eq!(u16::from_f64(-5.0), 0);
        assert_eq!(u16::from_f64(70000.0), u16::MAX);
        assert_eq!(i16::from_f64(-1024.4), -1024);
        assert_eq!(u8::from_f64(12.6), 13);
    }

    #[test]
    fn test_float_conversion() {
        assert_eq!(f32::from_f64(1.5), 1.5f32);
        assert_eq!(f16::from_f64(2.0).to_f64(), 2.0);
        assert_eq!(<f16 as Element>::ELEMENT_TYPE, ElementType::F16);
    }

    fn assert_element_size<T: Element>() {
        assert_eq!(T::ELEMENT_TYPE.size_of(), size_of::<T>());
    }

    #[test]
    fn test_element_type_matches_layout() {
        assert_element_size::<u8>();
        assert_element_size::<i8>();
        assert_element_size::<u16>();
        assert_element_size::<i16>();
        assert_element_size::<f32>();
        assert_element_size::<f16>();
    }
}
