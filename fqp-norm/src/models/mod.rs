//! Data models for the normalization pipeline
//!
//! The payload progression lives in `payload`; each phase owns one
//! sub-record type.

pub mod label;
pub mod payload;
pub mod stage_run;
pub mod statement;
pub mod unit;

pub use label::{
    CanonicalFigure, CanonicalStatement, LabelMapping, LabelNormalized, LabelReviewStatus,
    MappingStatus, SourceContext,
};
pub use payload::{NormalizedPayload, PayloadError};
pub use stage_run::{StageRun, StageState, StageStatus, StageVersions, COMPLETENESS_ERROR, STAGE_COUNT};
pub use statement::{
    DropReason, DroppedBlock, ParsedContent, RawFigure, RawStatement, Scope, SlotEntry,
    StatementHint, StatementKind, StatementMetadata, StatementNormalized, StatementSlot,
    NOT_PROVIDED,
};
pub use unit::{
    Confidence, FigureCorrection, FigureUnit, FilingAnalysis, FilingReviewData, Representation,
    ReviewQueueStatus, StatementUnitAnalysis, SuspiciousFigure, UnitAnalysis, UnitNormalized,
    UnitReviewRow, UnitReviewStatus, UnitSource, HUMAN_CORRECTED_REASONING,
};
