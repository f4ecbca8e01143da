//! Statement-level types: canonical slots and raw extracted blocks

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel stored for slots the filing did not provide
pub const NOT_PROVIDED: &str = "NOT_PROVIDED";

/// Reporting scope of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Standalone,
    Consolidated,
}

/// Statement kind, independent of scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Pnl,
    BalanceSheet,
    CashFlow,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Pnl => "pnl",
            StatementKind::BalanceSheet => "balance_sheet",
            StatementKind::CashFlow => "cash_flow",
        }
    }

    /// Normalize a taxonomy statement key (`cash_flow_direct`, `pnl`, ...)
    pub fn from_statement_key(key: &str) -> Option<Self> {
        let key = key.to_ascii_lowercase();
        if key.contains("pnl") {
            Some(StatementKind::Pnl)
        } else if key.contains("balance_sheet") {
            Some(StatementKind::BalanceSheet)
        } else if key.contains("cash_flow") {
            Some(StatementKind::CashFlow)
        } else {
            None
        }
    }
}

/// One of the six canonical statement slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementSlot {
    StandalonePnl,
    StandaloneBalanceSheet,
    StandaloneCashFlow,
    ConsolidatedPnl,
    ConsolidatedBalanceSheet,
    ConsolidatedCashFlow,
}

impl StatementSlot {
    pub const ALL: [StatementSlot; 6] = [
        StatementSlot::StandalonePnl,
        StatementSlot::StandaloneBalanceSheet,
        StatementSlot::StandaloneCashFlow,
        StatementSlot::ConsolidatedPnl,
        StatementSlot::ConsolidatedBalanceSheet,
        StatementSlot::ConsolidatedCashFlow,
    ];

    pub fn scope(&self) -> Scope {
        match self {
            StatementSlot::StandalonePnl
            | StatementSlot::StandaloneBalanceSheet
            | StatementSlot::StandaloneCashFlow => Scope::Standalone,
            StatementSlot::ConsolidatedPnl
            | StatementSlot::ConsolidatedBalanceSheet
            | StatementSlot::ConsolidatedCashFlow => Scope::Consolidated,
        }
    }

    pub fn kind(&self) -> StatementKind {
        match self {
            StatementSlot::StandalonePnl | StatementSlot::ConsolidatedPnl => StatementKind::Pnl,
            StatementSlot::StandaloneBalanceSheet | StatementSlot::ConsolidatedBalanceSheet => {
                StatementKind::BalanceSheet
            }
            StatementSlot::StandaloneCashFlow | StatementSlot::ConsolidatedCashFlow => {
                StatementKind::CashFlow
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementSlot::StandalonePnl => "standalone_pnl",
            StatementSlot::StandaloneBalanceSheet => "standalone_balance_sheet",
            StatementSlot::StandaloneCashFlow => "standalone_cash_flow",
            StatementSlot::ConsolidatedPnl => "consolidated_pnl",
            StatementSlot::ConsolidatedBalanceSheet => "consolidated_balance_sheet",
            StatementSlot::ConsolidatedCashFlow => "consolidated_cash_flow",
        }
    }

    /// Match free text (trimmed, case-insensitive) against the slot names
    pub fn parse(text: &str) -> Option<Self> {
        let wanted = text.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|slot| slot.as_str() == wanted)
    }
}

impl fmt::Display for StatementSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single extracted line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFigure {
    pub label: String,
    #[serde(default)]
    pub value: Option<f64>,
    /// Set by extraction when the value looked implausible
    #[serde(default)]
    pub suspect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspect_reason: Option<String>,
}

/// A raw statement block as produced by extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStatement {
    /// Free-text statement name from the filing
    pub statement_type: String,
    /// Statement-level currency/scale context, e.g. "in lacs"
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarter: Option<String>,
    #[serde(default)]
    pub figures: Vec<RawFigure>,
}

/// Upstream free-text -> slot hint produced during acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementHint {
    pub statement_name: String,
    pub mapping: String,
}

/// Content of a parsed document, as stored by extraction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedContent {
    #[serde(default)]
    pub statements_found: Vec<StatementHint>,
    #[serde(default)]
    pub statements: Vec<RawStatement>,
}

/// Slot content: a classified block or the explicit "not filed" sentinel
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEntry {
    Provided(RawStatement),
    NotProvided,
}

impl SlotEntry {
    pub fn statement(&self) -> Option<&RawStatement> {
        match self {
            SlotEntry::Provided(statement) => Some(statement),
            SlotEntry::NotProvided => None,
        }
    }
}

impl Serialize for SlotEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SlotEntry::Provided(statement) => statement.serialize(serializer),
            SlotEntry::NotProvided => serializer.serialize_str(NOT_PROVIDED),
        }
    }
}

impl<'de> Deserialize<'de> for SlotEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Marker(String),
            Statement(RawStatement),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Marker(marker) if marker == NOT_PROVIDED => Ok(SlotEntry::NotProvided),
            Repr::Marker(other) => Err(serde::de::Error::custom(format!(
                "unexpected slot marker '{}'",
                other
            ))),
            Repr::Statement(statement) => Ok(SlotEntry::Provided(statement)),
        }
    }
}

/// Why a raw block did not make it into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Unmapped,
    DuplicateSlot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedBlock {
    pub statement_type: String,
    pub reason: DropReason,
    #[serde(default)]
    pub mapping: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementMetadata {
    pub found_statements: Vec<StatementSlot>,
    pub missing_statements: Vec<StatementSlot>,
    pub total_statements_processed: usize,
    /// Free-text statement name -> upstream mapping text
    pub statement_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub dropped: Vec<DroppedBlock>,
}

/// Output of statement classification: all six slots, always
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementNormalized {
    pub slots: BTreeMap<StatementSlot, SlotEntry>,
    pub metadata: StatementMetadata,
}

impl StatementNormalized {
    pub fn slot(&self, slot: StatementSlot) -> Option<&RawStatement> {
        self.slots.get(&slot).and_then(SlotEntry::statement)
    }

    /// Provided slots in canonical order
    pub fn provided(&self) -> impl Iterator<Item = (StatementSlot, &RawStatement)> {
        StatementSlot::ALL
            .into_iter()
            .filter_map(move |slot| self.slot(slot).map(|statement| (slot, statement)))
    }

    /// Look up the raw figure for a label (trimmed comparison) within a slot
    pub fn raw_figure(&self, slot: StatementSlot, label: &str) -> Option<&RawFigure> {
        let wanted = label.trim();
        self.slot(slot)?
            .figures
            .iter()
            .find(|figure| figure.label.trim() == wanted)
    }
}
