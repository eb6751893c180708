//! Error enums shared by the frontend crates.
//!
//! Each crate lists its failures once in a `define_driver_error!` table: one
//! subsystem byte for the enum, one code byte and one log string per variant.
//! A variant may wrap the error of a lower layer; the macro then emits the
//! `From` impl so `?` lifts the lower error into the caller's enum, and
//! `Error::source` hands it back out.
//!
//! ```ignore
//! define_driver_error! {
//!     pub enum RingError(0x03) {
//!         Full = 0x01 => "Ring full",
//!         Hal(HalError) = 0x03 => "Ring setup failed",
//!     }
//! }
//! ```
//!
//! Formatted as `E<subsystem><code>: <text>`, followed by the wrapped error
//! in parentheses. No two wrapping variants of one enum may share an inner type.

#![no_std]

/// Declare a `Copy` error enum with stable numeric codes.
#[macro_export]
macro_rules! define_driver_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            pub const SUBSYSTEM: u8 = $subsystem;

            const fn parts(&self) -> (u8, &'static str) {
                match self {
                    $( $crate::define_driver_error!(@arm $variant $(($inner))?) => ($code, $desc), )*
                }
            }

            /// `SUBSYSTEM << 8 | variant code`.
            pub const fn code(&self) -> u16 {
                ((Self::SUBSYSTEM as u16) << 8) | self.parts().0 as u16
            }

            pub const fn name(&self) -> &'static str {
                self.parts().1
            }

            fn inner(&self) -> Option<&(dyn core::fmt::Display + 'static)> {
                match self {
                    $( $crate::define_driver_error!(@bind $variant $(($inner))? e) => {
                        $crate::define_driver_error!(@some $(($inner))? e)
                    } )*
                }
            }

            fn inner_error(&self) -> Option<&(dyn core::error::Error + 'static)> {
                match self {
                    $( $crate::define_driver_error!(@bind $variant $(($inner))? e) => {
                        $crate::define_driver_error!(@some $(($inner))? e)
                    } )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "E{:04X}: {}", self.code(), self.name())?;
                match self.inner() {
                    Some(inner) => write!(f, " ({})", inner),
                    None => Ok(()),
                }
            }
        }

        impl core::error::Error for $name {
            fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
                self.inner_error()
            }
        }

        $($(
            impl From<$inner> for $name {
                fn from(inner: $inner) -> Self {
                    Self::$variant(inner)
                }
            }
        )?)*
    };

    (@arm $variant:ident ($inner:ty)) => { Self::$variant(_) };
    (@arm $variant:ident) => { Self::$variant };

    (@bind $variant:ident ($inner:ty) $e:ident) => { Self::$variant($e) };
    (@bind $variant:ident $e:ident) => { Self::$variant };

    (@some ($inner:ty) $e:ident) => { Some($e) };
    (@some $e:ident) => { None };
}

#[cfg(test)]
mod tests {
    extern crate std;
    use core::error::Error;
    use std::format;

    define_driver_error! {
        /// Ring-level failures
        pub enum RingFault(0x03) {
            /// No free slot
            Full = 0x01 => "Ring full",
            /// Response for another request
            Mismatch = 0x02 => "Response id mismatch",
        }
    }

    define_driver_error! {
        pub enum DeviceFault(0x10) {
            Ring(RingFault) = 0x01 => "Control ring failure",
            BadResolution = 0x02 => "Resolution rejected",
        }
    }

    fn push() -> Result<u32, RingFault> {
        Err(RingFault::Full)
    }

    fn push_then_fail() -> Result<u32, DeviceFault> {
        let slot = push()?;
        Ok(slot)
    }

    #[test]
    fn test_codes_carry_subsystem() {
        assert_eq!(RingFault::Full.code(), 0x0301);
        assert_eq!(RingFault::Mismatch.code(), 0x0302);
        assert_eq!(DeviceFault::Ring(RingFault::Full).code(), 0x1001);
        assert_eq!(DeviceFault::BadResolution.code(), 0x1002);
        assert_eq!(RingFault::SUBSYSTEM, 0x03);
        assert_eq!(DeviceFault::SUBSYSTEM, 0x10);
    }

    #[test]
    fn test_names() {
        assert_eq!(RingFault::Mismatch.name(), "Response id mismatch");
        assert_eq!(DeviceFault::Ring(RingFault::Full).name(), "Control ring failure");
    }

    #[test]
    fn test_display_format() {
        assert_eq!(format!("{}", RingFault::Full), "E0301: Ring full");
        assert_eq!(
            format!("{}", DeviceFault::Ring(RingFault::Mismatch)),
            "E1001: Control ring failure (E0302: Response id mismatch)"
        );
    }

    #[test]
    fn test_source_is_wrapped_error() {
        let err = DeviceFault::Ring(RingFault::Mismatch);
        let source = err.source().map(|s| format!("{}", s));
        assert_eq!(source.as_deref(), Some("E0302: Response id mismatch"));
        assert!(DeviceFault::BadResolution.source().is_none());
        assert!(RingFault::Full.source().is_none());
    }

    #[test]
    fn test_question_mark_wraps_inner() {
        assert_eq!(push_then_fail(), Err(DeviceFault::Ring(RingFault::Full)));
    }
}
