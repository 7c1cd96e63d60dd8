//! Core domain model for the procurement radar.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "radar-core";

/// Placeholder title used when no source field carries a usable description.
pub const TITLE_SENTINEL: &str = "Sem título";

/// Sentinel notice number for the write-path health record written on degraded runs.
pub const PLACEHOLDER_NOTICE_NUMBER: &str = "RADAR-TESTE-0001";

/// External procurement-notice provider a record originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Portal {
    #[serde(rename = "COMPRASGOV")]
    ComprasGov,
    #[serde(rename = "PNCP")]
    Pncp,
}

impl Portal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Portal::ComprasGov => "COMPRASGOV",
            Portal::Pncp => "PNCP",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "COMPRASGOV" => Some(Portal::ComprasGov),
            "PNCP" => Some(Portal::Pncp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracking state assigned at ingestion time. Every record enters as `Monitoring`;
/// downstream jobs own any later transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    #[serde(rename = "monitorando")]
    Monitoring,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Monitoring => "monitorando",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "monitorando" => Some(OpportunityStatus::Monitoring),
            _ => None,
        }
    }
}

/// Canonical persisted shape every source maps into.
///
/// Field names and types are a de facto contract with the digest reader; renames
/// here are schema changes for it too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOpportunity {
    pub title: String,
    pub portal: Portal,
    pub agency: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub modality: Option<String>,
    pub notice_number: Option<String>,
    pub link: Option<String>,
    pub deadline_date: Option<NaiveDate>,
    pub status: OpportunityStatus,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalOpportunity {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            portal: self.portal,
            notice_number: self.notice_number.clone(),
            agency: self.agency.clone(),
        }
    }

    /// A record lacking both a real title and a notice number can never be matched
    /// against future updates and must be dropped before persistence.
    pub fn is_identifiable(&self) -> bool {
        let titled = !self.title.is_empty() && self.title != TITLE_SENTINEL;
        titled || self.notice_number.is_some()
    }
}

/// The (portal, notice_number, agency) triple identifying one opportunity across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub portal: Portal,
    pub notice_number: Option<String>,
    pub agency: Option<String>,
}

impl NaturalKey {
    /// Null-safe tuple form; absent parts collapse to the empty string, matching the
    /// unique index the store enforces.
    pub fn normalized(&self) -> (String, String, String) {
        (
            self.portal.as_str().to_string(),
            self.notice_number.clone().unwrap_or_default(),
            self.agency.clone().unwrap_or_default(),
        )
    }
}

/// Inputs a run was invoked with, recorded alongside its counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub targets: Vec<String>,
    pub year: Option<i32>,
    pub page_start: u32,
}

/// Append-only audit record. Exactly one per run, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionLogEntry {
    pub source: String,
    pub params: RunParams,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub degraded: bool,
    pub error: Option<String>,
}
