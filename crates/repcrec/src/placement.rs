//! Static data placement: which sites hold which variables.
//!
//! Odd-indexed variables live on exactly one site, `1 + (i mod S)`;
//! even-indexed variables are replicated on every site. Placement is fixed
//! for the life of the process.

use std::collections::BTreeMap;

use repcrec_error::{RepcrecError, Result};
use repcrec_types::{SiteId, VariableId};

/// The immutable placement policy for a database instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDirectory {
    sites: u32,
    variables: u32,
}

impl SiteDirectory {
    /// Reference configuration: 10 sites, 20 variables.
    #[must_use]
    pub const fn reference() -> Self {
        Self {
            sites: 10,
            variables: 20,
        }
    }

    /// Create a placement over `sites` sites and `variables` variables.
    ///
    /// # Errors
    ///
    /// Returns [`RepcrecError::InvalidLayout`] when either count is zero.
    pub fn new(sites: u32, variables: u32) -> Result<Self> {
        if sites == 0 {
            return Err(RepcrecError::InvalidLayout {
                detail: "site count must be at least 1".to_string(),
            });
        }
        if variables == 0 {
            return Err(RepcrecError::InvalidLayout {
                detail: "variable count must be at least 1".to_string(),
            });
        }
        Ok(Self { sites, variables })
    }

    /// Number of sites.
    #[must_use]
    pub const fn site_count(&self) -> u32 {
        self.sites
    }

    /// Number of variables.
    #[must_use]
    pub const fn variable_count(&self) -> u32 {
        self.variables
    }

    /// All site ids in ascending order.
    pub fn site_ids(&self) -> impl Iterator<Item = SiteId> + '_ {
        (1..=self.sites).map(|n| SiteId::new(n).expect("site ids start at 1"))
    }

    /// All variable ids in ascending order.
    pub fn variable_ids(&self) -> impl Iterator<Item = VariableId> + '_ {
        (1..=self.variables).map(|n| VariableId::new(n).expect("variable ids start at 1"))
    }

    /// Whether `site` exists in this placement.
    #[must_use]
    pub fn contains_site(&self, site: SiteId) -> bool {
        site.get() <= self.sites
    }

    /// Whether `variable` exists in this placement.
    #[must_use]
    pub fn contains_variable(&self, variable: VariableId) -> bool {
        variable.index() <= self.variables
    }

    /// The single home site of a non-replicated (odd-indexed) variable.
    #[must_use]
    pub fn home_site(&self, variable: VariableId) -> SiteId {
        debug_assert!(!variable.is_replicated());
        let n = 1 + variable.index() % self.sites;
        SiteId::new(n).expect("home site index is at least 1")
    }

    /// The ordered set of sites hosting `variable`.
    #[must_use]
    pub fn sites_for(&self, variable: VariableId) -> Vec<SiteId> {
        if variable.is_replicated() {
            self.site_ids().collect()
        } else {
            vec![self.home_site(variable)]
        }
    }

    /// Whether `site` hosts a copy of `variable`.
    #[must_use]
    pub fn hosts(&self, site: SiteId, variable: VariableId) -> bool {
        variable.is_replicated() || self.home_site(variable) == site
    }

    /// Default values for every variable hosted at `site`, keyed in variable
    /// order. This is the initial committed state installed at load time.
    #[must_use]
    pub fn defaults_at(&self, site: SiteId) -> BTreeMap<VariableId, i64> {
        self.variable_ids()
            .filter(|&v| self.hosts(site, v))
            .map(|v| (v, v.default_value()))
            .collect()
    }
}
