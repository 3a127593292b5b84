//! Value types a signal can carry.
//!
//! Every signal is generic over a [`SignalValue`]. The trait records the
//! descriptive information a consumer needs to interpret a reading without
//! looking at the value itself: the dtype class, the numpy dtype tag, the
//! shape, and for string enums the set of allowed choices.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Coarse dtype class reported in a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// Floating point scalar
    #[default]
    Number,
    /// Integer scalar
    Integer,
    /// Boolean scalar
    Boolean,
    /// String or enum
    String,
    /// N-dimensional array
    Array,
}

/// A type that can be stored in a [`Signal`](super::Signal).
pub trait SignalValue:
    Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Rust-side name used in error messages.
    const TYPE_NAME: &'static str;

    /// Dtype class of values of this type.
    fn dtype() -> Dtype;

    /// Numpy dtype tag of the element type, empty when there is none.
    fn dtype_numpy() -> &'static str {
        ""
    }

    /// Shape of this value, empty for scalars.
    fn shape(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Allowed values for enum-like types.
    fn choices() -> Vec<String> {
        Vec::new()
    }

    /// Value used when a soft or mock store is created without one.
    fn default_value() -> Self;
}

macro_rules! scalar_value {
    ($($ty:ty => $dtype:expr, $numpy:literal;)+) => {
        $(
            impl SignalValue for $ty {
                const TYPE_NAME: &'static str = stringify!($ty);

                fn dtype() -> Dtype {
                    $dtype
                }

                fn dtype_numpy() -> &'static str {
                    $numpy
                }

                fn default_value() -> Self {
                    <$ty>::default()
                }
            }
        )+
    };
}

scalar_value! {
    bool => Dtype::Boolean, "|b1";
    i8 => Dtype::Integer, "|i1";
    u8 => Dtype::Integer, "|u1";
    i16 => Dtype::Integer, "<i2";
    u16 => Dtype::Integer, "<u2";
    i32 => Dtype::Integer, "<i4";
    u32 => Dtype::Integer, "<u4";
    i64 => Dtype::Integer, "<i8";
    u64 => Dtype::Integer, "<u8";
    f32 => Dtype::Number, "<f4";
    f64 => Dtype::Number, "<f8";
}

impl SignalValue for String {
    const TYPE_NAME: &'static str = "String";

    fn dtype() -> Dtype {
        Dtype::String
    }

    fn dtype_numpy() -> &'static str {
        "|S40"
    }

    fn default_value() -> Self {
        String::new()
    }
}

macro_rules! array_value {
    ($($elem:ty),+) => {
        $(
            impl SignalValue for Vec<$elem> {
                const TYPE_NAME: &'static str = concat!("Vec<", stringify!($elem), ">");

                fn dtype() -> Dtype {
                    Dtype::Array
                }

                fn dtype_numpy() -> &'static str {
                    <$elem as SignalValue>::dtype_numpy()
                }

                fn shape(&self) -> Vec<usize> {
                    vec![self.len()]
                }

                fn default_value() -> Self {
                    Vec::new()
                }
            }
        )+
    };
}

array_value!(bool, i8, u8, i16, u16, i32, u32, i64, u64, f32, f64, String);

/// Declare a string-backed enum usable as a signal value.
///
/// The first variant is the default value of a freshly created soft store.
/// Labels are the strings exchanged with the hardware.
macro_rules! signal_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(#[$first_meta:meta])*
            $first:ident => $first_label:literal
            $(, $(#[$vmeta:meta])* $variant:ident => $label:literal)* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $(#[$first_meta])*
            #[doc = concat!("Label `", $first_label, "`")]
            #[serde(rename = $first_label)]
            $first,
            $(
                $(#[$vmeta])*
                #[doc = concat!("Label `", $label, "`")]
                #[serde(rename = $label)]
                $variant,
            )*
        }

        impl $name {
            /// Label exchanged with the hardware.
            pub fn as_str(&self) -> &'static str {
                match self {
                    Self::$first => $first_label,
                    $(Self::$variant => $label,)*
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl $crate::signal::SignalValue for $name {
            const TYPE_NAME: &'static str = stringify!($name);

            fn dtype() -> $crate::signal::Dtype {
                $crate::signal::Dtype::String
            }

            fn choices() -> Vec<String> {
                vec![$first_label.to_string() $(, $label.to_string())*]
            }

            fn default_value() -> Self {
                Self::$first
            }
        }
    };
}

pub(crate) use signal_enum;

#[cfg(test)]
mod tests {
    use super::*;

    signal_enum! {
        /// Test enum
        enum Color {
            Red => "Red",
            Green => "Green",
        }
    }

    #[test]
    fn scalar_descriptions() {
        assert_eq!(f64::dtype(), Dtype::Number);
        assert_eq!(f64::dtype_numpy(), "<f8");
        assert_eq!(u16::dtype_numpy(), "<u2");
        assert!(3.0f64.shape().is_empty());
    }

    #[test]
    fn arrays_report_their_length() {
        let v = vec![1.0f64, 2.0, 3.0];
        assert_eq!(v.shape(), vec![3]);
        assert_eq!(<Vec<f64>>::dtype(), Dtype::Array);
        assert_eq!(<Vec<f64>>::dtype_numpy(), "<f8");
    }

    #[test]
    fn enum_choices_and_default() {
        assert_eq!(Color::choices(), vec!["Red", "Green"]);
        assert_eq!(Color::default_value(), Color::Red);
        assert_eq!(serde_json::to_value(Color::Green).unwrap(), "Green");
        assert_eq!(Color::Green.to_string(), "Green");
    }
}
