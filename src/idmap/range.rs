//! Range Allocator
//!
//! Computes non-overlapping numeric ID ranges per mapping domain and
//! implements the overlap rules used during domain validation. Allocation
//! policy: ranges grow monotonically and freed ranges are never reused.

use crate::domain::ports::DirectoryServicesSnapshot;
use crate::error::{Error, Result, ValidationErrors};
use crate::idmap::backend::IdmapBackend;
use crate::idmap::domain::{DsType, MappingDomain};
use crate::idmap::RANGE_ALLOCATION_SPAN;

/// Compute the next free range from the existing domain set.
///
/// Takes the current maximum `range_high` and returns
/// `(max_high + 1, max_high + RANGE_ALLOCATION_SPAN)`. The domain set is
/// never legitimately empty: the built-in system domains pre-exist, so an
/// empty input is a contract violation by the caller.
pub fn next_range(existing: &[MappingDomain]) -> Result<(u32, u32)> {
    let max_high = existing
        .iter()
        .map(|d| d.range_high)
        .max()
        .ok_or_else(|| {
            Error::Internal(
                "next_range called with no configured idmap domains; \
                 system domains must pre-exist"
                    .to_string(),
            )
        })?;

    Ok((max_high + 1, max_high + RANGE_ALLOCATION_SPAN))
}

/// Whether two `[low, high)` intervals intersect
pub fn ranges_intersect(a_low: u32, a_high: u32, b_low: u32, b_high: u32) -> bool {
    a_low.max(b_low) < a_high.min(b_high)
}

/// Whether an intersection between a candidate domain and an existing one
/// is exempt from rejection.
///
/// The exemptions encode knowledge about the external daemon's own
/// allocation schemes and are preserved verbatim:
/// - domains of a directory service that is not enabled are ignored;
/// - an AUTORID-backed domain supersedes the system default domain's
///   range, so that pairing is permitted in either direction;
/// - two AUTORID-backed domains share one allocating pool;
/// - two AD-backed domains compute ranges algorithmically without static
///   reservation, so their declared ranges may collide.
pub fn overlap_exempt(
    candidate_name: &str,
    candidate_backend: IdmapBackend,
    existing: &MappingDomain,
    ds_state: &DirectoryServicesSnapshot,
) -> bool {
    if !ds_state.ldap.is_enabled() && existing.name == DsType::Ldap.name() {
        return true;
    }
    if !ds_state.activedirectory.is_enabled()
        && existing.name == DsType::ActiveDirectory.name()
    {
        return true;
    }

    // Idmap settings for the default domain are ignored while autorid
    // is in effect.
    if candidate_backend == IdmapBackend::Autorid
        && existing.name == DsType::DefaultDomain.name()
    {
        return true;
    }
    if existing.idmap_backend == IdmapBackend::Autorid
        && candidate_name == DsType::DefaultDomain.name()
    {
        return true;
    }
    if candidate_backend == IdmapBackend::Autorid
        && existing.idmap_backend == IdmapBackend::Autorid
    {
        return true;
    }

    if candidate_backend == IdmapBackend::Ad && existing.idmap_backend == IdmapBackend::Ad {
        return true;
    }

    false
}

/// Check a candidate domain's range against every other configured domain,
/// recording a violation for each non-exempt intersection. The violation
/// names both conflicting domains and both ranges.
#[allow(clippy::too_many_arguments)]
pub fn check_range_conflicts(
    schema: &str,
    candidate_id: Option<i64>,
    candidate_name: &str,
    candidate_backend: IdmapBackend,
    range_low: u32,
    range_high: u32,
    existing: &[MappingDomain],
    ds_state: &DirectoryServicesSnapshot,
    verrors: &mut ValidationErrors,
) {
    for other in existing {
        if Some(other.id) == candidate_id {
            continue;
        }

        if overlap_exempt(candidate_name, candidate_backend, other, ds_state) {
            continue;
        }

        if ranges_intersect(range_low, range_high, other.range_low, other.range_high) {
            verrors.add(
                format!("{schema}.range_low"),
                format!(
                    "new idmap range [{range_low}-{range_high}] conflicts with existing \
                     range for domain [{}], range: [{}-{}].",
                    other.name, other.range_low, other.range_high
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DirectoryServiceState;
    use std::collections::BTreeMap;

    fn domain(
        id: i64,
        name: &str,
        backend: IdmapBackend,
        range_low: u32,
        range_high: u32,
    ) -> MappingDomain {
        MappingDomain {
            id,
            name: name.to_string(),
            dns_domain_name: None,
            range_low,
            range_high,
            idmap_backend: backend,
            options: BTreeMap::new(),
            certificate_id: None,
        }
    }

    fn enabled_state() -> DirectoryServicesSnapshot {
        DirectoryServicesSnapshot {
            activedirectory: DirectoryServiceState::Healthy,
            ldap: DirectoryServiceState::Healthy,
        }
    }

    #[test]
    fn test_next_range_monotonic() {
        let domains = vec![
            domain(1, "DS_TYPE_DEFAULT_DOMAIN", IdmapBackend::Tdb, 90_000_001, 100_000_000),
            domain(2, "CORP", IdmapBackend::Rid, 100_000_001, 200_000_000),
        ];

        let (low, high) = next_range(&domains).unwrap();
        assert_eq!(low, 200_000_001);
        assert_eq!(high, 300_000_000);

        // The returned range never overlaps any existing one
        for d in &domains {
            assert!(!ranges_intersect(low, high, d.range_low, d.range_high));
        }
    }

    #[test]
    fn test_next_range_empty_is_contract_violation() {
        let err = next_range(&[]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_ranges_intersect() {
        assert!(ranges_intersect(1_000_000, 1_100_000, 1_050_000, 1_150_000));
        assert!(!ranges_intersect(1_000_000, 1_100_000, 1_100_000, 1_200_000));
        assert!(ranges_intersect(10, 20, 5, 40));
    }

    #[test]
    fn test_overlap_exempt_autorid_default_pairing() {
        let state = enabled_state();
        let default = domain(1, "DS_TYPE_DEFAULT_DOMAIN", IdmapBackend::Tdb, 90_000_001, 100_000_000);
        assert!(overlap_exempt("DS_TYPE_ACTIVEDIRECTORY", IdmapBackend::Autorid, &default, &state));

        let autorid = domain(2, "DS_TYPE_ACTIVEDIRECTORY", IdmapBackend::Autorid, 90_000_001, 100_000_000);
        assert!(overlap_exempt("DS_TYPE_DEFAULT_DOMAIN", IdmapBackend::Tdb, &autorid, &state));
    }

    #[test]
    fn test_overlap_exempt_ad_pair() {
        let state = enabled_state();
        let other = domain(3, "CORP", IdmapBackend::Ad, 1_000_000, 2_000_000);
        assert!(overlap_exempt("OTHER", IdmapBackend::Ad, &other, &state));
        assert!(!overlap_exempt("OTHER", IdmapBackend::Rid, &other, &state));
    }

    #[test]
    fn test_overlap_exempt_disabled_service() {
        let mut state = enabled_state();
        state.ldap = DirectoryServiceState::Disabled;
        let ldap_domain = domain(4, "DS_TYPE_LDAP", IdmapBackend::Ldap, 10_000, 90_000_000);
        assert!(overlap_exempt("CORP", IdmapBackend::Rid, &ldap_domain, &state));

        state.ldap = DirectoryServiceState::Healthy;
        assert!(!overlap_exempt("CORP", IdmapBackend::Rid, &ldap_domain, &state));
    }

    #[test]
    fn test_check_range_conflicts_names_both_domains() {
        let existing = vec![domain(5, "CORP", IdmapBackend::Rid, 1_000_000, 1_100_000)];
        let mut verrors = ValidationErrors::new();

        check_range_conflicts(
            "idmap_domain_create",
            None,
            "SECOND",
            IdmapBackend::Rid,
            1_050_000,
            1_150_000,
            &existing,
            &enabled_state(),
            &mut verrors,
        );

        assert_eq!(verrors.issues().len(), 1);
        let issue = &verrors.issues()[0];
        assert_eq!(issue.attribute, "idmap_domain_create.range_low");
        assert!(issue.message.contains("CORP"));
        assert!(issue.message.contains("1050000-1150000"));
        assert!(issue.message.contains("1000000-1100000"));
    }

    #[test]
    fn test_check_range_conflicts_skips_self() {
        let existing = vec![domain(6, "CORP", IdmapBackend::Rid, 1_000_000, 1_100_000)];
        let mut verrors = ValidationErrors::new();

        check_range_conflicts(
            "idmap_domain_update",
            Some(6),
            "CORP",
            IdmapBackend::Rid,
            1_000_000,
            1_100_000,
            &existing,
            &enabled_state(),
            &mut verrors,
        );
        assert!(verrors.is_empty());
    }
}
