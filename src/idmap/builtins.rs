//! Well-known SIDs and builtin identity assignment
//!
//! See MS-DTYP 2.4.2.4. Most of these groups will never be used on
//! production servers. Numeric IDs are statically assigned (based on the
//! idmap low range) so that replicating data between two appliances
//! yields the same effective permissions with no unexpected elevation.
//!
//! Entries may be appended to this list; ordering determines the GID
//! assigned to each builtin.

/// SID prefix the file server synthesizes for local users without an
/// explicit mapping
pub const SID_LOCAL_USER_PREFIX: &str = "S-1-22-1-";

/// SID prefix the file server synthesizes for local groups without an
/// explicit mapping
pub const SID_LOCAL_GROUP_PREFIX: &str = "S-1-22-2-";

/// SIDs the mapping daemon allocates on its own before any well-known
/// entry; their count offsets the first builtin GID
pub const WINBINDD_AUTO_ALLOCATED: [&str; 3] =
    ["S-1-5-32-544", "S-1-5-32-545", "S-1-5-32-546"];

/// Head-room left above the builtin assignments when bumping the
/// allocation high-water mark
pub const WELL_KNOWN_PADDING: u32 = 100;

/// One well-known Windows identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownSid {
    pub name: &'static str,
    pub sid: &'static str,
    /// Whether a persistent mapping is written for this entry
    pub set: bool,
}

pub const WELL_KNOWN_SIDS: [WellKnownSid; 19] = [
    WellKnownSid { name: "NULL", sid: "S-1-0-0", set: false },
    WellKnownSid { name: "EVERYONE", sid: "S-1-1-0", set: true },
    WellKnownSid { name: "LOCAL", sid: "S-1-2-0", set: true },
    WellKnownSid { name: "CONSOLE_LOGON", sid: "S-1-2-1", set: true },
    WellKnownSid { name: "CREATOR_OWNER", sid: "S-1-3-0", set: true },
    WellKnownSid { name: "CREATOR_GROUP", sid: "S-1-3-1", set: true },
    WellKnownSid { name: "OWNER_RIGHTS", sid: "S-1-3-4", set: true },
    WellKnownSid { name: "DIALUP", sid: "S-1-5-1", set: true },
    WellKnownSid { name: "NETWORK", sid: "S-1-5-2", set: true },
    WellKnownSid { name: "BATCH", sid: "S-1-5-3", set: true },
    WellKnownSid { name: "INTERACTIVE", sid: "S-1-5-4", set: true },
    WellKnownSid { name: "SERVICE", sid: "S-1-5-6", set: true },
    WellKnownSid { name: "ANONYMOUS", sid: "S-1-5-7", set: true },
    WellKnownSid { name: "AUTHENTICATED_USERS", sid: "S-1-5-11", set: true },
    WellKnownSid { name: "TERMINAL_SERVER_USER", sid: "S-1-5-13", set: true },
    WellKnownSid { name: "REMOTE_AUTHENTICATED_LOGON", sid: "S-1-5-14", set: true },
    WellKnownSid { name: "LOCAL_SYSTEM", sid: "S-1-5-18", set: true },
    WellKnownSid { name: "LOCAL_SERVICE", sid: "S-1-5-19", set: true },
    WellKnownSid { name: "NETWORK_SERVICE", sid: "S-1-5-20", set: true },
];

/// A well-known identity with its deterministic GID assignment
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuiltinAssignment {
    pub name: String,
    pub sid: String,
    pub set: bool,
    /// Position in the well-known table
    pub id: usize,
    /// Assigned numeric group id
    pub gid: u32,
}

/// Deterministic builtin GID assignments for a given default-domain low
/// range. The first three GIDs above `low_range` belong to the daemon's
/// auto-allocated groups.
pub fn builtin_assignments(low_range: u32) -> Vec<BuiltinAssignment> {
    WELL_KNOWN_SIDS
        .iter()
        .enumerate()
        .map(|(idx, entry)| BuiltinAssignment {
            name: entry.name.to_string(),
            sid: entry.sid.to_string(),
            set: entry.set,
            id: idx,
            gid: low_range + WINBINDD_AUTO_ALLOCATED.len() as u32 + idx as u32,
        })
        .collect()
}
