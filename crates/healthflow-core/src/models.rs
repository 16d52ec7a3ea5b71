//! Core data models used throughout HealthFlow.
//!
//! Relationships are expressed as plain identifiers (`owner_id`,
//! `document_id`); no model holds a reference to another. Status and type
//! fields are closed enums persisted in their snake_case string form.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a closed enum with a stable snake_case string form, plus
/// `as_str`, `Display`, `FromStr` and serde support.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }
    };
}

string_enum! {
    /// Where a document is in the ingestion state machine.
    pub enum ProcessingStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        PartiallyCompleted => "partially_completed",
    }
}

impl ProcessingStatus {
    /// Terminal states are the ones a pipeline run settles into.
    pub fn is_terminal(&self) -> bool {
        match self {
            ProcessingStatus::Completed
            | ProcessingStatus::Failed
            | ProcessingStatus::PartiallyCompleted => true,
            ProcessingStatus::Pending | ProcessingStatus::Processing => false,
        }
    }
}

string_enum! {
    /// User-supplied classification of an uploaded document.
    pub enum DocumentType {
        LabReport => "lab_report",
        MedicationList => "medication_list",
        DischargeSummary => "discharge_summary",
        ImagingReport => "imaging_report",
        Prescription => "prescription",
        InsuranceCard => "insurance_card",
        InsuranceEob => "insurance_eob",
        VaccinationRecord => "vaccination_record",
        AllergyList => "allergy_list",
        CarePlan => "care_plan",
        VisitSummary => "visit_summary",
        Referral => "referral",
        VoiceNote => "voice_note",
        Other => "other",
    }
}

string_enum! {
    pub enum EntityType {
        Medication => "medication",
        LabResult => "lab_result",
        Diagnosis => "diagnosis",
        Symptom => "symptom",
        Doctor => "doctor",
        Appointment => "appointment",
        Procedure => "procedure",
        Allergy => "allergy",
        VitalSign => "vital_sign",
        Immunization => "immunization",
    }
}

string_enum! {
    pub enum EventType {
        LabCompleted => "lab_completed",
        MedicationStarted => "medication_started",
        MedicationEnded => "medication_ended",
        SymptomLogged => "symptom_logged",
        AppointmentScheduled => "appointment_scheduled",
        AppointmentCompleted => "appointment_completed",
        ProcedureCompleted => "procedure_completed",
        DiagnosisReceived => "diagnosis_received",
        DocumentUploaded => "document_uploaded",
        VitalRecorded => "vital_recorded",
        ImmunizationReceived => "immunization_received",
    }
}

string_enum! {
    pub enum MessageRole {
        User => "user",
        Assistant => "assistant",
        System => "system",
    }
}

/// An uploaded document and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub file_name: String,
    pub storage_path: String,
    pub mime_type: String,
    pub file_size: i64,
    pub document_type: DocumentType,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    /// Free-form user metadata. Never read by the pipeline.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub tags: Vec<String>,
    pub document_date: Option<NaiveDate>,
    pub uploaded_at: i64,
    pub processed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A bounded slice of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub owner_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub char_count: i64,
    /// SHA-256 of `text`, used as the embedding cache key.
    pub hash: String,
    pub created_at: i64,
}

/// An embedding model and the contract its vectors must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    pub name: String,
    /// Vector dimensionality.
    pub dims: usize,
    /// Longest input accepted, in estimated tokens.
    pub max_input_tokens: usize,
}

/// One similarity-search hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub similarity: f32,
    pub created_at: i64,
    pub text: String,
}

/// A chunk whose embedding failed and is waiting to be retried.
#[derive(Debug, Clone, Serialize)]
pub struct RetryEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub owner_id: String,
    pub model: String,
    pub attempts: i64,
    pub last_error: String,
    pub updated_at: i64,
}

/// Structured medical fact, optionally derived from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicalEntity {
    pub id: String,
    pub owner_id: String,
    /// Weak back-reference; nulled when the document is deleted.
    pub document_id: Option<String>,
    pub entity_type: EntityType,
    pub entity_data: serde_json::Value,
    pub entity_date: Option<NaiveDate>,
    pub extraction_confidence: Option<f32>,
    pub is_verified: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub owner_id: String,
    /// Weak back-reference; nulled when the document is deleted.
    pub document_id: Option<String>,
    pub event_type: EventType,
    pub title: String,
    pub description: Option<String>,
    pub event_date: NaiveDate,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub owner_id: String,
    pub title: Option<String>,
    pub started_at: i64,
    pub last_message_at: i64,
}

/// What a chat message reference points at. Exactly one target kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ReferenceTarget {
    Document(String),
    MedicalEntity(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReference {
    pub target: ReferenceTarget,
    pub relevance_score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub owner_id: String,
    pub role: MessageRole,
    pub content: String,
    pub model_name: Option<String>,
    pub created_at: i64,
    pub references: Vec<MessageReference>,
}
