//! Interface descriptors and compile-time interface metadata.

use crate::ids::InterfaceId;
use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Static description of one interface: identity, human-readable name and
/// the `(major, minor)` version pair.
///
/// Produced at compile time per interface type; all fields are constant
/// for the lifetime of the process.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    /// Interface identifier.
    pub iid: InterfaceId,
    /// Interface name, e.g. `Greeter`.
    pub name: &'static str,
    /// Major version. Differing majors are never compatible.
    pub major: u32,
    /// Minor version. Callers may require a minimum minor.
    pub minor: u32,
}

impl Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}.{}", self.name, self.major, self.minor)
    }
}

/// Compile-time metadata attached to the `dyn Trait` type of an interface.
///
/// Implemented through [`declare_interface!`](crate::declare_interface),
/// never by hand.
pub trait InterfaceMeta: 'static {
    /// Interface identifier, hashed from the interface UUID.
    const IID: InterfaceId;
    /// Interface name.
    const NAME: &'static str;
    /// Major version of the interface as compiled into this crate.
    const VERSION_MAJOR: u32;
    /// Minor version of the interface as compiled into this crate.
    const VERSION_MINOR: u32;
    /// The interface descriptor assembled from the constants above.
    const DESCRIPTOR: InterfaceDescriptor = InterfaceDescriptor {
        iid: Self::IID,
        name: Self::NAME,
        major: Self::VERSION_MAJOR,
        minor: Self::VERSION_MINOR,
    };
}

/// Attaches identity and version metadata to an interface trait.
///
/// The trait must have [`Component`](crate::Component) as a supertrait.
///
/// ```
/// use veld_component::Component;
///
/// pub trait Greeter: Component {
///     fn greet(&self) -> String;
/// }
/// veld_component::declare_interface!(Greeter, "veld-doc-greeter-IID-6F201A44", 1, 0);
/// ```
#[macro_export]
macro_rules! declare_interface {
    ($iface:ident, $uuid:literal, $major:expr, $minor:expr) => {
        impl $crate::InterfaceMeta for dyn $iface {
            const IID: $crate::InterfaceId = $crate::interface_id($uuid);
            const NAME: &'static str = stringify!($iface);
            const VERSION_MAJOR: u32 = $major;
            const VERSION_MINOR: u32 = $minor;
        }
    };
}
