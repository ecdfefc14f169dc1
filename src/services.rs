//! Per-service ownership and permission specs for provisioned secrets.
//!
//! A secret field lists the services allowed to receive it. Each entry says
//! which uid/gid should own the provisioned file and with which mode. The
//! entry may be written in a short positional form or as a map:
//!
//! ```toml
//! services = ["django"]                          # default placement
//! services = { django = [1000] }                 # uid, gid follows
//! services = { django = [1000, 2000, 0o640] }    # uid, gid, mode
//! services = { nginx = { gid = "www-data" } }    # map form, names allowed
//! ```

use crate::defaults::default_secret_mode;
use crate::errors::{self, Result};
use nix::unistd::{Group, User};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// A user or group given either numerically or by name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Owner {
    /// Numeric uid/gid; need not exist in the user database.
    Id(u32),
    /// Name looked up in the user/group database at provisioning time.
    Name(String),
}

impl Owner {
    fn resolve_user(&self) -> Result<(u32, Option<u32>)> {
        match self {
            Self::Id(id) => Ok((*id, None)),
            Self::Name(name) => {
                let user = User::from_name(name)
                    .map_err(|e| errors::nix_error("resolve_user", "/etc/passwd", e))?
                    .ok_or_else(|| errors::unknown_owner("user", name))?;
                Ok((user.uid.as_raw(), Some(user.gid.as_raw())))
            }
        }
    }

    fn resolve_group(&self) -> Result<u32> {
        match self {
            Self::Id(id) => Ok(*id),
            Self::Name(name) => Group::from_name(name)
                .map_err(|e| errors::nix_error("resolve_group", "/etc/group", e))?
                .map(|group| group.gid.as_raw())
                .ok_or_else(|| errors::unknown_owner("group", name)),
        }
    }
}

impl From<u32> for Owner {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Owner {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

/// Unresolved ownership/permission request of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ServiceSpecRepr")]
pub struct ServiceSpec {
    uid: Option<Owner>,
    gid: Option<Owner>,
    mode: Option<u32>,
}

impl ServiceSpec {
    /// Root-owned, mode 0400.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of the provisioned file. The group follows unless set.
    #[must_use]
    pub fn uid(mut self, owner: impl Into<Owner>) -> Self {
        self.uid = Some(owner.into());
        self
    }

    /// Group of the provisioned file.
    #[must_use]
    pub fn gid(mut self, group: impl Into<Owner>) -> Self {
        self.gid = Some(group.into());
        self
    }

    /// Permission bits of the provisioned file.
    #[must_use]
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Resolve names and fill in defaults.
    ///
    /// Modes outside the permission bits (setuid, sticky and above) are
    /// rejected.
    pub fn placement(&self) -> Result<Placement> {
        let mode = self.mode.unwrap_or_else(default_secret_mode);
        if mode & !0o777 != 0 {
            return Err(errors::improperly_configured(
                "resolve_placement",
                format!("mode {mode:o} is outside 0o777"),
            ));
        }
        let (uid, primary_gid) = match &self.uid {
            Some(owner) => {
                let (uid, primary) = owner.resolve_user()?;
                (uid, Some(primary.unwrap_or(uid)))
            }
            None => (0, None),
        };
        let gid = match &self.gid {
            Some(group) => group.resolve_group()?,
            None => primary_gid.unwrap_or(0),
        };
        Ok(Placement { uid, gid, mode })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServiceSpecRepr {
    Short(Vec<Owner>),
    Map(MapRepr),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MapRepr {
    #[serde(default)]
    uid: Option<Owner>,
    #[serde(default)]
    gid: Option<Owner>,
    #[serde(default)]
    mode: Option<u32>,
}

impl TryFrom<ServiceSpecRepr> for ServiceSpec {
    type Error = String;

    fn try_from(repr: ServiceSpecRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ServiceSpecRepr::Map(map) => Ok(Self {
                uid: map.uid,
                gid: map.gid,
                mode: map.mode,
            }),
            ServiceSpecRepr::Short(items) => {
                if items.len() > 3 {
                    return Err(format!(
                        "service spec takes at most 3 items (uid, gid, mode), got {}",
                        items.len()
                    ));
                }
                let mut items = items.into_iter();
                let uid = items.next();
                let gid = items.next();
                let mode = match items.next() {
                    None => None,
                    Some(Owner::Id(mode)) => Some(mode),
                    Some(Owner::Name(_)) => return Err("service mode must be numeric".to_owned()),
                };
                Ok(Self { uid, gid, mode })
            }
        }
    }
}

/// Resolved owner, group and mode of a provisioned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Owner uid.
    pub uid: u32,
    /// Group gid.
    pub gid: u32,
    /// Permission bits.
    pub mode: u32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: default_secret_mode(),
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {:o}", self.uid, self.gid, self.mode)
    }
}

/// Access-control list of a secret field: service name to placement request.
pub type Services = BTreeMap<String, ServiceSpec>;

/// Services as written in a manifest: a list of names or a map of specs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ServicesRepr {
    Names(Vec<String>),
    Map(Services),
}

impl From<ServicesRepr> for Services {
    fn from(repr: ServicesRepr) -> Self {
        match repr {
            ServicesRepr::Names(names) => names
                .into_iter()
                .map(|name| (name, ServiceSpec::default()))
                .collect(),
            ServicesRepr::Map(map) => map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(toml_spec: &str) -> Placement {
        #[derive(Deserialize)]
        struct Wrapper {
            spec: ServiceSpec,
        }
        let wrapper: Wrapper = toml::from_str(&format!("spec = {toml_spec}")).unwrap();
        wrapper.spec.placement().unwrap()
    }

    #[test]
    fn short_and_map_forms_normalize() {
        let cases = [
            ("[]", (0, 0, 0o400)),
            ("[1000]", (1000, 1000, 0o400)),
            ("[1000, 2000]", (1000, 2000, 0o400)),
            ("[1000, 2000, 0o640]", (1000, 2000, 0o640)),
            ("{}", (0, 0, 0o400)),
            ("{ uid = 1000 }", (1000, 1000, 0o400)),
            ("{ gid = 1000 }", (0, 1000, 0o400)),
            ("{ uid = 5, mode = 0o440 }", (5, 5, 0o440)),
        ];
        for (spec, (uid, gid, mode)) in cases {
            assert_eq!(placement(spec), Placement { uid, gid, mode }, "spec {spec}");
        }
    }

    #[test]
    fn too_many_positional_items_rejected() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Wrapper {
            spec: ServiceSpec,
        }
        assert!(toml::from_str::<Wrapper>("spec = [1, 2, 3, 4]").is_err());
        assert!(toml::from_str::<Wrapper>("spec = [1, 2, \"rw\"]").is_err());
        assert!(toml::from_str::<Wrapper>("spec = { owner = 1 }").is_err());
    }

    #[test]
    fn builder_matches_positional_form() {
        let spec = ServiceSpec::new().uid(1000u32).gid(2000u32).mode(0o640);
        assert_eq!(
            spec.placement().unwrap(),
            Placement {
                uid: 1000,
                gid: 2000,
                mode: 0o640
            }
        );
    }

    #[test]
    fn root_user_name_resolves() {
        let spec = ServiceSpec::new().uid("root");
        let placement = spec.placement().unwrap();
        assert_eq!(placement.uid, 0);
        assert_eq!(placement.gid, 0);
    }

    #[test]
    fn unknown_user_name_is_an_error() {
        let spec = ServiceSpec::new().uid("no-such-user-stackconf");
        assert!(matches!(
            spec.placement(),
            Err(crate::ConfError::UnknownOwner { .. })
        ));
        let spec = ServiceSpec::new().gid("no-such-group-stackconf");
        assert!(matches!(
            spec.placement(),
            Err(crate::ConfError::UnknownOwner { .. })
        ));
    }

    #[test]
    fn modes_beyond_permission_bits_are_rejected() {
        for mode in [0o4755, 0o1600, 0o10000] {
            let err = ServiceSpec::new().mode(mode).placement().unwrap_err();
            assert!(matches!(err, crate::ConfError::ImproperlyConfigured { .. }));
        }
        assert_eq!(ServiceSpec::new().mode(0o777).placement().unwrap().mode, 0o777);
    }

    #[test]
    fn name_list_gets_default_placements() {
        let services: Services = ServicesRepr::Names(vec!["django".into(), "nginx".into()]).into();
        assert_eq!(services.len(), 2);
        assert_eq!(services["django"], ServiceSpec::default());
    }
}
