/// Three-axis group access control.
///
/// Each axis independently filters the values it accepts from the wire;
/// anything else maps to `Unknown` rather than failing the whole parse.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessLevel {
    Unknown = 0,
    Any = 1,
    Member = 2,
    Administrator = 3,
    /// No one can satisfy this axis. Used to disable the invite link.
    Unsatisfiable = 4,
}

impl AccessLevel {
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    fn from_wire_raw(value: u8) -> AccessLevel {
        match value {
            1 => AccessLevel::Any,
            2 => AccessLevel::Member,
            3 => AccessLevel::Administrator,
            4 => AccessLevel::Unsatisfiable,
            _ => AccessLevel::Unknown,
        }
    }

    /// Parse a members/attributes axis value. `Unsatisfiable` is not valid
    /// on these axes.
    pub fn members_axis_from_wire(value: u8) -> AccessLevel {
        match Self::from_wire_raw(value) {
            level @ (AccessLevel::Any | AccessLevel::Member | AccessLevel::Administrator) => level,
            other => {
                if other != AccessLevel::Unknown {
                    log::warn!("Invalid members/attributes access value: {}", value);
                }
                AccessLevel::Unknown
            }
        }
    }

    /// Parse the add-from-invite-link axis value. `Member` is not valid on
    /// this axis.
    pub fn invite_link_axis_from_wire(value: u8) -> AccessLevel {
        match Self::from_wire_raw(value) {
            level @ (AccessLevel::Any | AccessLevel::Administrator | AccessLevel::Unsatisfiable) => {
                level
            }
            other => {
                if other != AccessLevel::Unknown {
                    log::warn!("Invalid invite-link access value: {}", value);
                }
                AccessLevel::Unknown
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupAccess {
    /// Who may change membership.
    pub members: AccessLevel,
    /// Who may change title, description, avatar, and timer.
    pub attributes: AccessLevel,
    /// Who may join via the invite link, and whether approval is required.
    pub add_from_invite_link: AccessLevel,
}

impl GroupAccess {
    /// Access for a freshly created group: members administer themselves,
    /// link joining disabled.
    pub fn default_for_new_group() -> Self {
        GroupAccess {
            members: AccessLevel::Member,
            attributes: AccessLevel::Member,
            add_from_invite_link: AccessLevel::Unsatisfiable,
        }
    }

    pub fn all_unknown() -> Self {
        GroupAccess {
            members: AccessLevel::Unknown,
            attributes: AccessLevel::Unknown,
            add_from_invite_link: AccessLevel::Unknown,
        }
    }

    /// Whether the invite link is usable at all.
    pub fn is_invite_link_enabled(&self) -> bool {
        matches!(
            self.add_from_invite_link,
            AccessLevel::Any | AccessLevel::Administrator
        )
    }
}
