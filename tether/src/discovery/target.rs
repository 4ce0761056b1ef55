use faststr::FastStr;

use crate::registry::{service_prefix, ConfigError, ServiceType, DEFAULT_NAMESPACE};

/// URI scheme accepted for store-backed targets, as in `etcd://user`.
pub const ETCD_SCHEME: &str = "etcd";

/// A logical service to resolve.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub namespace: FastStr,
    pub service_type: ServiceType,
    pub name: FastStr,
}

impl Target {
    pub fn new(name: impl Into<FastStr>) -> Self {
        Self {
            namespace: FastStr::from_static_str(DEFAULT_NAMESPACE),
            service_type: ServiceType::default(),
            name: name.into(),
        }
    }

    /// Parse `etcd://<name>` (or a bare name) into a target with defaults.
    pub fn parse(target: &str) -> Result<Self, ConfigError> {
        let name = match target.split_once("://") {
            Some((scheme, rest)) if scheme == ETCD_SCHEME => rest,
            Some(_) => return Err(ConfigError::InvalidTarget(FastStr::new(target))),
            None => target,
        };
        if name.is_empty() || name.contains('/') {
            return Err(ConfigError::InvalidTarget(FastStr::new(target)));
        }
        Ok(Self::new(FastStr::new(name)))
    }

    pub fn with_namespace(mut self, namespace: impl Into<FastStr>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    /// The store prefix every instance of this service lives under.
    pub fn prefix(&self) -> String {
        service_prefix(&self.namespace, self.service_type, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheme_and_bare() {
        let t = Target::parse("etcd://user").unwrap();
        assert_eq!(t.name, "user");
        assert_eq!(t.namespace, "default");
        assert_eq!(t.prefix(), "/default/services/rpc/user/");

        let bare = Target::parse("user").unwrap();
        assert_eq!(bare, t);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme_and_empty_name() {
        assert!(Target::parse("dns://user").is_err());
        assert!(Target::parse("etcd://").is_err());
        assert!(Target::parse("etcd://a/b").is_err());
    }

    #[test]
    fn test_builder_prefix() {
        let t = Target::new("user")
            .with_namespace("prod")
            .with_service_type(ServiceType::Api);
        assert_eq!(t.prefix(), "/prod/services/api/user/");
    }
}
