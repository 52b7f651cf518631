//! Core data models for provider master data.
//!
//! Raw captures, clusters, golden records, affiliations, change events and
//! violations. Everything here is plain serializable data; behavior that
//! depends on configuration lives in the engine modules.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kinds of master-data entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Provider,
    Facility,
}

impl EntityType {
    /// Stable lowercase name used in storage and violation keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Provider => "provider",
            EntityType::Facility => "facility",
        }
    }

    /// Parses the stable name back into an entity type.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "provider" => Some(EntityType::Provider),
            "facility" => Some(EntityType::Facility),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one source row: the source system plus its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub source: String,
    pub natural_key: String,
}

impl RecordKey {
    /// Creates a record key.
    pub fn new(source: impl Into<String>, natural_key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            natural_key: natural_key.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.natural_key)
    }
}

/// A typed field value carried through synthesis.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
}

impl FieldValue {
    /// Count of meaningful characters; the synthesizer's completeness measure.
    pub fn completeness_len(&self) -> usize {
        match self {
            FieldValue::Text(s) => s.chars().filter(|c| !c.is_whitespace()).count(),
            FieldValue::Integer(i) => i.to_string().len(),
            FieldValue::Date(d) => d.to_string().len(),
        }
    }

    /// Returns the text payload if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the date payload if this is a date value.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Converts to a JSON value for snapshots and reporting.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) => serde_json::Value::String(s.clone()),
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Date(d) => serde_json::Value::String(d.to_string()),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Date(d) => write!(f, "{}", d),
        }
    }
}

/// Field names of provider golden records.
pub mod provider_fields {
    pub const NPI: &str = "npi";
    pub const FIRST_NAME: &str = "first_name";
    pub const MIDDLE_NAME: &str = "middle_name";
    pub const LAST_NAME: &str = "last_name";
    pub const DISPLAY_NAME: &str = "display_name";
    pub const CREDENTIAL: &str = "credential";
    pub const SPECIALTY: &str = "specialty";
    pub const LICENSE_NUMBER: &str = "license_number";
    pub const LICENSE_STATE: &str = "license_state";
    pub const LICENSE_EXPIRY: &str = "license_expiry";
    pub const EMAIL: &str = "email";
    pub const PHONE: &str = "phone";
    pub const BIRTH_YEAR: &str = "birth_year";
    pub const GRADUATION_YEAR: &str = "graduation_year";
    pub const YEARS_IN_PRACTICE: &str = "years_in_practice";

    /// All synthesized provider fields, in output order.
    pub const ALL: &[&str] = &[
        NPI,
        FIRST_NAME,
        MIDDLE_NAME,
        LAST_NAME,
        DISPLAY_NAME,
        CREDENTIAL,
        SPECIALTY,
        LICENSE_NUMBER,
        LICENSE_STATE,
        LICENSE_EXPIRY,
        EMAIL,
        PHONE,
        BIRTH_YEAR,
        GRADUATION_YEAR,
        YEARS_IN_PRACTICE,
    ];
}

/// Field names of facility golden records.
pub mod facility_fields {
    pub const IDENTIFIER: &str = "identifier";
    pub const NAME: &str = "name";
    pub const ADDRESS_LINE: &str = "address_line";
    pub const CITY: &str = "city";
    pub const STATE: &str = "state";
    pub const POSTAL_CODE: &str = "postal_code";
    pub const FACILITY_TYPE: &str = "facility_type";

    /// All synthesized facility fields, in output order.
    pub const ALL: &[&str] = &[
        IDENTIFIER,
        NAME,
        ADDRESS_LINE,
        CITY,
        STATE,
        POSTAL_CODE,
        FACILITY_TYPE,
    ];
}

/// Common view over per-source captures used by matching and synthesis.
pub trait SourceRecord: Clone + Send + Sync {
    /// Entity type this record describes.
    const ENTITY_TYPE: EntityType;

    /// Source system and natural key.
    fn record_key(&self) -> RecordKey;

    /// Source system identifier.
    fn source(&self) -> &str;

    /// When the source captured this version.
    fn captured_at(&self) -> DateTime<Utc>;

    /// Names of the fields synthesis resolves.
    fn field_names() -> &'static [&'static str];

    /// Value of one field; blank text is reported as absent.
    fn field_value(&self, field: &str) -> Option<FieldValue>;

    /// Confidence the source itself reported for this row, if any.
    fn reported_confidence(&self) -> Option<f64> {
        None
    }
}

/// Affiliation hint reported by a source on a provider row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationHint {
    /// Source-agnostic facility identifier
    pub facility_ref: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

/// One captured provider row from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProviderRecord {
    pub source: String,
    pub natural_key: String,
    #[serde(default)]
    pub npi: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub license_number: Option<String>,
    #[serde(default)]
    pub license_state: Option<String>,
    #[serde(default)]
    pub license_expiry: Option<NaiveDate>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub birth_year: Option<i32>,
    #[serde(default)]
    pub graduation_year: Option<i32>,
    #[serde(default)]
    pub years_in_practice: Option<i32>,
    #[serde(default)]
    pub affiliations: Vec<AffiliationHint>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub source_confidence: Option<f64>,
}

impl RawProviderRecord {
    /// Creates a minimal record; remaining fields are set directly.
    pub fn new(
        source: impl Into<String>,
        natural_key: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            natural_key: natural_key.into(),
            npi: None,
            first_name: None,
            middle_name: None,
            last_name: None,
            display_name: None,
            credential: None,
            specialty: None,
            license_number: None,
            license_state: None,
            license_expiry: None,
            email: None,
            phone: None,
            birth_year: None,
            graduation_year: None,
            years_in_practice: None,
            affiliations: Vec::new(),
            captured_at,
            source_confidence: None,
        }
    }

    /// Name used for similarity comparisons: display name when present,
    /// otherwise first/middle/last joined.
    pub fn comparison_name(&self) -> String {
        if let Some(display) = non_blank(&self.display_name) {
            return display.to_string();
        }
        [&self.first_name, &self.middle_name, &self.last_name]
            .iter()
            .filter_map(|part| non_blank(part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl SourceRecord for RawProviderRecord {
    const ENTITY_TYPE: EntityType = EntityType::Provider;

    fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.source, &self.natural_key)
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    fn field_names() -> &'static [&'static str] {
        provider_fields::ALL
    }

    fn field_value(&self, field: &str) -> Option<FieldValue> {
        use provider_fields as f;
        match field {
            f::NPI => text(&self.npi),
            f::FIRST_NAME => text(&self.first_name),
            f::MIDDLE_NAME => text(&self.middle_name),
            f::LAST_NAME => text(&self.last_name),
            f::DISPLAY_NAME => text(&self.display_name),
            f::CREDENTIAL => text(&self.credential),
            f::SPECIALTY => text(&self.specialty),
            f::LICENSE_NUMBER => text(&self.license_number),
            f::LICENSE_STATE => text(&self.license_state),
            f::LICENSE_EXPIRY => self.license_expiry.map(FieldValue::Date),
            f::EMAIL => text(&self.email),
            f::PHONE => text(&self.phone),
            f::BIRTH_YEAR => self.birth_year.map(|v| FieldValue::Integer(i64::from(v))),
            f::GRADUATION_YEAR => self
                .graduation_year
                .map(|v| FieldValue::Integer(i64::from(v))),
            f::YEARS_IN_PRACTICE => self
                .years_in_practice
                .map(|v| FieldValue::Integer(i64::from(v))),
            _ => None,
        }
    }

    fn reported_confidence(&self) -> Option<f64> {
        self.source_confidence
    }
}

/// One captured facility row from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub source: String,
    pub natural_key: String,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address_line: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub facility_type: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl FacilityRecord {
    /// Creates a minimal facility record.
    pub fn new(
        source: impl Into<String>,
        natural_key: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            natural_key: natural_key.into(),
            identifier: None,
            name: None,
            address_line: None,
            city: None,
            state: None,
            postal_code: None,
            facility_type: None,
            captured_at,
        }
    }
}

impl SourceRecord for FacilityRecord {
    const ENTITY_TYPE: EntityType = EntityType::Facility;

    fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.source, &self.natural_key)
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    fn field_names() -> &'static [&'static str] {
        facility_fields::ALL
    }

    fn field_value(&self, field: &str) -> Option<FieldValue> {
        use facility_fields as f;
        match field {
            f::IDENTIFIER => text(&self.identifier),
            f::NAME => text(&self.name),
            f::ADDRESS_LINE => text(&self.address_line),
            f::CITY => text(&self.city),
            f::STATE => text(&self.state),
            f::POSTAL_CODE => text(&self.postal_code),
            f::FACILITY_TYPE => text(&self.facility_type),
            _ => None,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn text(value: &Option<String>) -> Option<FieldValue> {
    non_blank(value).map(|s| FieldValue::Text(s.to_string()))
}

/// Matching tier that produced a membership edge, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTier {
    Exact,
    Fuzzy,
    Relational,
}

impl MatchTier {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::Exact => "exact",
            MatchTier::Fuzzy => "fuzzy",
            MatchTier::Relational => "relational",
        }
    }
}

/// A confidence-scored link between two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEdge {
    pub from: RecordKey,
    pub to: RecordKey,
    pub tier: MatchTier,
    pub confidence: f64,
}

/// A record admitted into a cluster and the edge that admitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember<R> {
    pub record: R,
    /// None for singletons and the seed record of edge-built clusters
    pub tier: Option<MatchTier>,
    pub confidence: f64,
}

/// A set of source records believed to describe one real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster<R> {
    pub id: String,
    pub entity_type: EntityType,
    pub members: Vec<ClusterMember<R>>,
    pub edges: Vec<MatchEdge>,
    /// Set when matching could not pick between competing assignments
    pub ambiguity: Option<String>,
}

impl<R: SourceRecord> Cluster<R> {
    /// Keys of all member records, sorted.
    pub fn member_keys(&self) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.members.iter().map(|m| m.record.record_key()).collect();
        keys.sort();
        keys
    }

    /// Whether the cluster needs manual review before synthesis.
    pub fn is_ambiguous(&self) -> bool {
        self.ambiguity.is_some()
    }

    /// Iterates the member records.
    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.members.iter().map(|m| &m.record)
    }
}

/// Provider cluster
pub type ProviderCluster = Cluster<RawProviderRecord>;
/// Facility cluster
pub type FacilityCluster = Cluster<FacilityRecord>;

/// Which tie-break step picked a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionRule {
    /// All contributing records agree
    Unanimous,
    /// Highest configured source credibility
    Credibility,
    /// Most recent capture
    Recency,
    /// Longest / most complete value
    Completeness,
    /// No winner; value left null and flagged
    Unresolved,
    /// No contributing record carries the field
    Absent,
}

impl ResolutionRule {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionRule::Unanimous => "unanimous",
            ResolutionRule::Credibility => "credibility",
            ResolutionRule::Recency => "recency",
            ResolutionRule::Completeness => "completeness",
            ResolutionRule::Unresolved => "unresolved",
            ResolutionRule::Absent => "absent",
        }
    }

    /// Parses the stable name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unanimous" => Some(ResolutionRule::Unanimous),
            "credibility" => Some(ResolutionRule::Credibility),
            "recency" => Some(ResolutionRule::Recency),
            "completeness" => Some(ResolutionRule::Completeness),
            "unresolved" => Some(ResolutionRule::Unresolved),
            "absent" => Some(ResolutionRule::Absent),
            _ => None,
        }
    }
}

/// A synthesized field with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub value: Option<FieldValue>,
    pub winning_source: Option<String>,
    pub winning_record: Option<RecordKey>,
    pub rule: ResolutionRule,
    /// True when sources disagreed and no rule could pick a winner
    pub conflict: bool,
    /// Number of member records that carried a value
    pub candidates: u32,
}

impl ResolvedField {
    /// A field no member record carries.
    pub fn absent() -> Self {
        Self {
            value: None,
            winning_source: None,
            winning_record: None,
            rule: ResolutionRule::Absent,
            conflict: false,
            candidates: 0,
        }
    }
}

/// The authoritative record for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenRecord {
    pub cluster_id: String,
    pub entity_type: EntityType,
    pub fields: BTreeMap<String, ResolvedField>,
    pub source_records: Vec<RecordKey>,
    /// Latest capture time among contributing records
    pub last_captured_at: Option<DateTime<Utc>>,
    /// Assigned by the store; 0 for unsaved records
    pub version: u32,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl GoldenRecord {
    /// Resolved value of a field.
    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).and_then(|f| f.value.as_ref())
    }

    /// Text value of a field.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.value(field).and_then(FieldValue::as_text)
    }

    /// Integer value of a field.
    pub fn integer(&self, field: &str) -> Option<i64> {
        self.value(field).and_then(FieldValue::as_integer)
    }

    /// Date value of a field.
    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        self.value(field).and_then(FieldValue::as_date)
    }

    /// Fields the synthesizer could not resolve.
    pub fn conflicted_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.conflict)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether two records carry the same synthesized content, ignoring
    /// storage bookkeeping (version, timestamps, active flag).
    pub fn same_content(&self, other: &GoldenRecord) -> bool {
        self.cluster_id == other.cluster_id
            && self.entity_type == other.entity_type
            && self.fields == other.fields
            && self.source_records == other.source_records
    }

    /// Flat JSON view of field values, used for quality snapshots.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        self.fields
            .iter()
            .map(|(name, field)| {
                let value = field
                    .value
                    .as_ref()
                    .map_or(serde_json::Value::Null, FieldValue::to_json);
                (name.clone(), value)
            })
            .collect()
    }
}

/// Provider-to-facility link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub provider_id: String,
    pub facility_id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_primary: bool,
    /// Source whose hint supplied this link
    pub source: String,
}

impl Affiliation {
    /// Active affiliations have no end date.
    pub fn is_active(&self) -> bool {
        self.end_date.is_none()
    }
}

/// Change operations captured from sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }

    /// Parses the stable name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(ChangeOperation::Insert),
            "update" => Some(ChangeOperation::Update),
            "delete" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

/// Append-only record of one source-side change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub batch_id: String,
    /// Position within the batch; unique per batch
    pub sequence: u64,
    pub source: String,
    pub entity_type: EntityType,
    /// Natural key of the affected row in its source
    pub entity_key: String,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub before: Option<serde_json::Value>,
    #[serde(default)]
    pub after: Option<serde_json::Value>,
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Key of the source row this event touches.
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.source, &self.entity_key)
    }
}

/// A unit of work that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub batch_id: String,
    pub entity_key: Option<String>,
    /// Error classification, see `GoldrecError::kind`
    pub reason: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Violation severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Parses the stable name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Violation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationStatus {
    Open,
    InProgress,
    Resolved,
    FalsePositive,
    AcceptedRisk,
}

impl ViolationStatus {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Open => "OPEN",
            ViolationStatus::InProgress => "IN_PROGRESS",
            ViolationStatus::Resolved => "RESOLVED",
            ViolationStatus::FalsePositive => "FALSE_POSITIVE",
            ViolationStatus::AcceptedRisk => "ACCEPTED_RISK",
        }
    }

    /// Parses the stable name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(ViolationStatus::Open),
            "IN_PROGRESS" => Some(ViolationStatus::InProgress),
            "RESOLVED" => Some(ViolationStatus::Resolved),
            "FALSE_POSITIVE" => Some(ViolationStatus::FalsePositive),
            "ACCEPTED_RISK" => Some(ViolationStatus::AcceptedRisk),
            _ => None,
        }
    }

    /// OPEN and IN_PROGRESS violations still need attention.
    pub fn is_active(&self) -> bool {
        matches!(self, ViolationStatus::Open | ViolationStatus::InProgress)
    }

    /// Manual overrides survive re-evaluation until explicitly cleared.
    pub fn is_manual_override(&self) -> bool {
        matches!(
            self,
            ViolationStatus::AcceptedRisk | ViolationStatus::FalsePositive
        )
    }
}

impl std::fmt::Display for ViolationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a violation: one per rule and entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViolationKey {
    pub rule_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
}

/// A recorded rule failure and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub severity: Severity,
    pub description: String,
    pub detected_value: Option<String>,
    pub expected_value: Option<String>,
    pub status: ViolationStatus,
    pub first_detected_at: DateTime<Utc>,
    pub last_detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub reopen_count: u32,
}

impl Violation {
    /// Identity of this violation.
    pub fn key(&self) -> ViolationKey {
        ViolationKey {
            rule_name: self.rule_name.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Violation write that only applies while the stored row is unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationWrite {
    pub violation: Violation,
    /// Status of the stored row the write was computed from; `None` when no
    /// row was stored
    pub expected: Option<ViolationStatus>,
}

/// Activity volume of one entity in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCount {
    pub entity_id: String,
    pub period: NaiveDate,
    pub count: u64,
}

/// Point-in-time read of everything evaluation and scoring look at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityGraph {
    /// Active provider golden records
    pub providers: Vec<GoldenRecord>,
    /// Active facility golden records
    pub facilities: Vec<GoldenRecord>,
    pub affiliations: Vec<Affiliation>,
    pub violations: Vec<Violation>,
    pub activity: Vec<ActivityCount>,
    /// Current provider captures, read with the rest of the graph
    #[serde(default)]
    pub current_providers: Vec<RawProviderRecord>,
    /// Current facility captures, read with the rest of the graph
    #[serde(default)]
    pub current_facilities: Vec<FacilityRecord>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl EntityGraph {
    /// Affiliations of one provider.
    pub fn affiliations_of<'a>(&'a self, provider_id: &'a str) -> impl Iterator<Item = &'a Affiliation> {
        self.affiliations
            .iter()
            .filter(move |a| a.provider_id == provider_id)
    }
}

#[cfg(test)]
#[path = "models_tests.rs"]
mod tests;
