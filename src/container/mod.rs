//! The canonical container record and everything derived from it.
//!
//! Runtime adapters describe what they observed as a runtime neutral [`ContainerSpec`]; the
//! [`ContainerDetail`] built from it carries the derived tags, k8s info and env configs that the
//! filter and the stdout service work with.
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod detail;
mod env_config;
mod error;
mod k8s;
mod spec;

pub use detail::{
    CONTAINERD_LOG_DRIVER, ContainerDetail, ContainerState, Mount, StdoutFraming, unix_nanos,
};
pub use env_config::EnvConfig;
pub use error::{Error, Result};
pub use k8s::{
    K8S_POD_NAME_LABEL, K8S_POD_NAMESPACE_LABEL, K8S_POD_UID_LABEL, K8S_SANDBOX_ID_LABEL, K8sInfo,
    is_inner_label, pod_labels,
};
pub use spec::{ContainerSpec, DetailOptions};

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// Number of characters shown by [`ContainerID::short`].
const CONTAINER_ID_SHORT_LEN: usize = 12;

pub const IMAGE_NAME_TAG: &str = "_image_name_";
pub const CONTAINER_NAME_TAG: &str = "_container_name_";
pub const POD_NAME_TAG: &str = "_pod_name_";
pub const NAMESPACE_TAG: &str = "_namespace_";
pub const POD_UID_TAG: &str = "_pod_uid_";
pub const CONTAINER_IP_TAG: &str = "_container_ip_";

/// A validated container identifier.
///
/// # Examples
///
/// ```
/// # use container_stdout_core::container::{ContainerID, Error};
/// let raw_id = "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd";
/// let container_id = ContainerID::new(raw_id).unwrap();
/// assert_eq!(container_id.as_ref(), "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd");
/// assert_eq!(container_id.short(), "abc123abc123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is empty or its length exceeds
    /// [`CONTAINER_ID_MAX_LEN`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use container_stdout_core::container::{ContainerID, Error};
    /// assert!(ContainerID::new("abcdef012345").is_ok());
    /// assert!(ContainerID::new("").is_err());
    /// ```
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty() || src.len() > CONTAINER_ID_MAX_LEN {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    pub fn to_arc(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }

    /// The leading characters of the id, as printed by container CLIs.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(CONTAINER_ID_SHORT_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerID {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for ContainerID {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_bounds() {
        assert!(ContainerID::new("a".repeat(CONTAINER_ID_MAX_LEN)).is_ok());
        let err = ContainerID::new("a".repeat(CONTAINER_ID_MAX_LEN + 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidContainerID(_)));
        assert!(matches!(
            "".parse::<ContainerID>(),
            Err(Error::InvalidContainerID(_))
        ));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(ContainerID::new("abc").unwrap().short(), "abc");
        assert_eq!(
            ContainerID::new("0123456789abcdef").unwrap().short(),
            "0123456789ab"
        );
    }
}
