//! Device descriptions

use std::fmt;
use std::sync::Arc;

/// Opaque description blob announced with a discovered device
///
/// The format belongs to the consumer (typically JSON). The runtime only
/// stores and replays it, so cloning shares the underlying string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescription(Arc<str>);

impl DeviceDescription {
    pub fn new(description: impl Into<Arc<str>>) -> Self {
        DeviceDescription(description.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for DeviceDescription {
    fn from(value: &str) -> Self {
        DeviceDescription::new(value)
    }
}

impl From<String> for DeviceDescription {
    fn from(value: String) -> Self {
        DeviceDescription::new(value)
    }
}

impl AsRef<str> for DeviceDescription {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceDescription({:?})", &*self.0)
    }
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
