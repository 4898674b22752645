//! Deterministic scenarios exercising the protection service end to end.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// WDN-001: Many spawns, every actor attacking everything
    OwnerRush,

    /// WDN-002: Short protections expiring in waves
    ExpiryWave,

    /// WDN-003: Crash and restart with protections in flight
    ColdRestart,

    /// WDN-004: More announced locations than the cache holds
    LocationFlood,

    /// WDN-005: Actors hammering the relocation gate with thin wallets
    RelocationRush,

    /// WDN-006: Authority offline while spawns keep coming
    AuthorityOutage,

    /// WDN-007: Spawn bursts against the background flush worker
    FlushStorm,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::OwnerRush,
            ScenarioId::ExpiryWave,
            ScenarioId::ColdRestart,
            ScenarioId::LocationFlood,
            ScenarioId::RelocationRush,
            ScenarioId::AuthorityOutage,
            ScenarioId::FlushStorm,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::OwnerRush => "owner_rush",
            ScenarioId::ExpiryWave => "expiry_wave",
            ScenarioId::ColdRestart => "cold_restart",
            ScenarioId::LocationFlood => "location_flood",
            ScenarioId::RelocationRush => "relocation_rush",
            ScenarioId::AuthorityOutage => "authority_outage",
            ScenarioId::FlushStorm => "flush_storm",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::OwnerRush => "Only the nearest actor may engage a fresh spawn; authority agrees",
            ScenarioId::ExpiryWave => "5s protections: no denial after expiry, one announcement each",
            ScenarioId::ColdRestart => "Restart mid-run, resync restores live protections and purges the rest",
            ScenarioId::LocationFlood => "5000 announced locations against a 4096 cap",
            ScenarioId::RelocationRush => "Cooldown and fee hold under contention; failed charges are free",
            ScenarioId::AuthorityOutage => "Local enforcement during outage, reload converges the authority",
            ScenarioId::FlushStorm => "Mutation bursts coalesce into few writes; shutdown persists all",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner_rush" | "ownerrush" | "wdn-001" => Ok(ScenarioId::OwnerRush),
            "expiry_wave" | "expirywave" | "wdn-002" => Ok(ScenarioId::ExpiryWave),
            "cold_restart" | "coldrestart" | "wdn-003" => Ok(ScenarioId::ColdRestart),
            "location_flood" | "locationflood" | "wdn-004" => Ok(ScenarioId::LocationFlood),
            "relocation_rush" | "relocationrush" | "wdn-005" => Ok(ScenarioId::RelocationRush),
            "authority_outage" | "authorityoutage" | "wdn-006" => Ok(ScenarioId::AuthorityOutage),
            "flush_storm" | "flushstorm" | "wdn-007" => Ok(ScenarioId::FlushStorm),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
