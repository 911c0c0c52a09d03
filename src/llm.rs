//! The provider-agnostic LLM adapter.
//!
//! Two operations sit behind one configuration surface: transaction
//! classification and document parsing (plus the secondary merchant
//! normalizer the ingestion pipeline uses). Providers are a closed
//! tagged set, never an inheritance hierarchy, and a failing provider
//! produces a typed no-answer value; the orchestrator treats confidence
//! as the only signal and never sees an exception from here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use time::Date;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::{
    config::{Config, LlmProvider},
    csv::parse_flexible_date,
    transaction::ReceiptLineItem,
    Error,
};

/// Upper bound on parallel outstanding classification calls in the batch
/// variant.
pub const MAX_CONCURRENT_CLASSIFICATIONS: usize = 5;

/// Per-call deadline on outbound provider requests.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The kind of document the parser is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Csv,
    Pdf,
    Image,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Csv => "csv",
            DocumentKind::Pdf => "pdf",
            DocumentKind::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "csv" => Some(DocumentKind::Csv),
            "pdf" => Some(DocumentKind::Pdf),
            "image" => Some(DocumentKind::Image),
            _ => None,
        }
    }
}

/// The provider settings the adapter runs with.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub anthropic_model: String,
    pub anthropic_api_key: Option<String>,
    pub vertex_project_id: String,
    pub vertex_location: String,
    pub vertex_model: String,
    pub vertex_access_token: Option<String>,
}

impl LlmSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: config.llm_provider,
            anthropic_model: config.anthropic_model.clone(),
            anthropic_api_key: config.anthropic_api_key.clone(),
            vertex_project_id: config.project_id.clone(),
            vertex_location: config.vertex_location.clone(),
            vertex_model: config.vertex_model.clone(),
            vertex_access_token: config.vertex_access_token.clone(),
        }
    }
}

/// One category the classifier may pick from.
#[derive(Debug, Clone)]
pub struct CategoryChoice {
    pub id: String,
    pub name: String,
}

/// The transaction fields offered to the classifier.
#[derive(Debug, Clone)]
pub struct ClassifyItem {
    pub description: String,
    pub merchant_raw: String,
    /// Signed cents.
    pub amount: i64,
}

/// A classification verdict. A provider failure is expressed as
/// `category_id: None, confidence: 0.0` with the failure in `reasoning`
/// and `unavailable` set, so the orchestrator can fall back to the rule
/// result it already computed instead of discarding it.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category_id: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub model: Option<String>,
    /// The provider could not be reached or its output was unusable.
    /// Distinct from a reachable classifier answering "no category".
    pub unavailable: bool,
}

impl Classification {
    /// The typed value for a provider that could not answer at all.
    pub fn no_answer(reasoning: impl Into<String>) -> Self {
        Self {
            category_id: None,
            confidence: 0.0,
            reasoning: reasoning.into(),
            model: None,
            unavailable: true,
        }
    }
}

/// The classification seam. The orchestrator is generic over this so
/// tests inject a stub instead of a network client.
pub trait Classifier: Send + Sync {
    fn classify(
        &self,
        item: &ClassifyItem,
        categories: &[CategoryChoice],
    ) -> impl std::future::Future<Output = Classification> + Send;
}

/// A transaction extracted from a document by the multimodal parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocTransaction {
    pub posted_at: Date,
    /// Signed cents.
    pub amount: i64,
    pub description: String,
    pub merchant_raw: String,
}

/// The receipt block an image parse may additionally carry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptBlock {
    pub merchant: Option<String>,
    pub line_items: Vec<ReceiptLineItem>,
}

/// The outcome of parsing one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub transactions: Vec<ParsedDocTransaction>,
    pub receipt: Option<ReceiptBlock>,
}

#[derive(Debug, Clone)]
struct LlmInner {
    settings: LlmSettings,
    http: reqwest::Client,
}

/// The process-wide LLM client. Reconfiguring swaps the provider and
/// resets the cached HTTP client behind a lock; reads clone a snapshot so
/// no lock is held across a provider call.
pub struct LlmClient {
    inner: RwLock<LlmInner>,
}

enum ContentPart {
    Text(String),
    Binary { mime_type: String, bytes: Vec<u8> },
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            inner: RwLock::new(LlmInner {
                settings,
                http: reqwest::Client::new(),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(LlmSettings::from_config(config))
    }

    /// Swap the provider configuration. The cached HTTP client is reset.
    pub fn reconfigure(&self, settings: LlmSettings) {
        let mut inner = self.inner.write().expect("LLM settings lock poisoned");
        *inner = LlmInner {
            settings,
            http: reqwest::Client::new(),
        };
    }

    fn snapshot(&self) -> LlmInner {
        self.inner.read().expect("LLM settings lock poisoned").clone()
    }

    /// Parse a financial document into transactions (and, for images, a
    /// receipt block).
    ///
    /// # Errors
    /// Returns [Error::LlmUnavailable] when the provider cannot be
    /// reached and [Error::ParseFailure] when its output is not usable.
    pub async fn parse_document(
        &self,
        bytes: &[u8],
        kind: DocumentKind,
        mime_type: Option<&str>,
    ) -> Result<ParsedDocument, Error> {
        let mut parts = vec![ContentPart::Text(document_prompt(kind))];

        match kind {
            DocumentKind::Csv => {
                parts.push(ContentPart::Text(String::from_utf8_lossy(bytes).into_owned()));
            }
            DocumentKind::Pdf => parts.push(ContentPart::Binary {
                mime_type: mime_type.unwrap_or("application/pdf").to_owned(),
                bytes: bytes.to_vec(),
            }),
            DocumentKind::Image => parts.push(ContentPart::Binary {
                mime_type: mime_type.unwrap_or("image/jpeg").to_owned(),
                bytes: bytes.to_vec(),
            }),
        }

        let completion = self.complete(parts).await.map_err(Error::LlmUnavailable)?;

        parse_document_text(&completion.text)
    }

    /// Normalize a merchant descriptor. Secondary to the deterministic
    /// normalizer; the pipeline keeps the deterministic result when this
    /// fails.
    pub async fn normalize_merchant(&self, merchant_raw: &str) -> Result<String, Error> {
        let prompt = format!(
            "Normalize this bank statement merchant descriptor to a short canonical \
             merchant name in uppercase. Reply with the name only, no punctuation and \
             no explanation.\n\nDescriptor: {merchant_raw}"
        );

        let completion = self
            .complete(vec![ContentPart::Text(prompt)])
            .await
            .map_err(Error::LlmUnavailable)?;

        let name = completion
            .text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
            .to_uppercase();

        if name.is_empty() {
            return Err(Error::LlmUnavailable(
                "merchant normalizer returned nothing".to_owned(),
            ));
        }

        Ok(name)
    }

    async fn complete(&self, parts: Vec<ContentPart>) -> Result<Completion, String> {
        let inner = self.snapshot();

        match inner.settings.provider {
            LlmProvider::ClaudeLike => complete_claude(&inner, parts).await,
            LlmProvider::VertexLike => complete_vertex(&inner, parts).await,
        }
    }
}

impl Classifier for LlmClient {
    async fn classify(&self, item: &ClassifyItem, categories: &[CategoryChoice]) -> Classification {
        let prompt = classification_prompt(item, categories);

        match self.complete(vec![ContentPart::Text(prompt)]).await {
            Ok(completion) => {
                parse_classification(&completion.text, categories, Some(completion.model))
            }
            Err(failure) => {
                tracing::debug!("classification unavailable: {failure}");
                Classification::no_answer(failure)
            }
        }
    }
}

/// Classify many transactions with bounded concurrency. Returns a result
/// per input id once every call settles; individual failures become
/// no-answer values and never fail the batch. Input order is not
/// preserved, which is why results are keyed by id.
pub async fn classify_batch<C>(
    classifier: Arc<C>,
    items: Vec<(String, ClassifyItem)>,
    categories: Vec<CategoryChoice>,
) -> HashMap<String, Classification>
where
    C: Classifier + 'static,
{
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CLASSIFICATIONS));
    let categories = Arc::new(categories);
    let mut join_set = JoinSet::new();

    for (id, item) in items {
        let classifier = Arc::clone(&classifier);
        let semaphore = Arc::clone(&semaphore);
        let categories = Arc::clone(&categories);

        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (id, Classification::no_answer("classifier pool closed"));
            };

            let classification = classifier.classify(&item, &categories).await;
            (id, classification)
        });
    }

    let mut results = HashMap::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((id, classification)) => {
                results.insert(id, classification);
            }
            Err(error) => {
                tracing::error!("classification task panicked: {error}");
            }
        }
    }

    results
}

struct Completion {
    text: String,
    model: String,
}

async fn complete_claude(inner: &LlmInner, parts: Vec<ContentPart>) -> Result<Completion, String> {
    let api_key = inner
        .settings
        .anthropic_api_key
        .as_deref()
        .ok_or_else(|| "ANTHROPIC_API_KEY is not configured".to_owned())?;

    let content: Vec<serde_json::Value> = parts
        .into_iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({ "type": "text", "text": text }),
            ContentPart::Binary { mime_type, bytes } => {
                let block_type = if mime_type.starts_with("image/") {
                    "image"
                } else {
                    "document"
                };
                json!({
                    "type": block_type,
                    "source": {
                        "type": "base64",
                        "media_type": mime_type,
                        "data": BASE64_STANDARD.encode(bytes),
                    },
                })
            }
        })
        .collect();

    let body = json!({
        "model": inner.settings.anthropic_model,
        "max_tokens": 2048,
        "messages": [{ "role": "user", "content": content }],
    });

    let response = inner
        .http
        .post(ANTHROPIC_MESSAGES_URL)
        .timeout(PROVIDER_TIMEOUT)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|error| format!("request failed: {error}"))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(format!("provider returned {status}: {detail}"));
    }

    let payload: serde_json::Value = response
        .json()
        .await
        .map_err(|error| format!("unreadable provider response: {error}"))?;

    let text = payload["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if text.is_empty() {
        return Err("provider response carried no text".to_owned());
    }

    let model = payload["model"]
        .as_str()
        .unwrap_or(&inner.settings.anthropic_model)
        .to_owned();

    Ok(Completion { text, model })
}

async fn complete_vertex(inner: &LlmInner, parts: Vec<ContentPart>) -> Result<Completion, String> {
    let token = inner
        .settings
        .vertex_access_token
        .as_deref()
        .ok_or_else(|| "VERTEX_ACCESS_TOKEN is not configured".to_owned())?;

    let url = format!(
        "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:generateContent",
        location = inner.settings.vertex_location,
        project = inner.settings.vertex_project_id,
        model = inner.settings.vertex_model,
    );

    let request_parts: Vec<serde_json::Value> = parts
        .into_iter()
        .map(|part| match part {
            ContentPart::Text(text) => json!({ "text": text }),
            ContentPart::Binary { mime_type, bytes } => json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": BASE64_STANDARD.encode(bytes),
                },
            }),
        })
        .collect();

    let body = json!({
        "contents": [{ "role": "user", "parts": request_parts }],
    });

    let response = inner
        .http
        .post(&url)
        .timeout(PROVIDER_TIMEOUT)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .map_err(|error| format!("request failed: {error}"))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(format!("provider returned {status}: {detail}"));
    }

    let payload: serde_json::Value = response
        .json()
        .await
        .map_err(|error| format!("unreadable provider response: {error}"))?;

    let text = payload["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|candidate_parts| {
            candidate_parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if text.is_empty() {
        return Err("provider response carried no text".to_owned());
    }

    Ok(Completion {
        text,
        model: inner.settings.vertex_model.clone(),
    })
}

// ============================================================================
// PROMPTS AND OUTPUT PARSING
// ============================================================================

fn classification_prompt(item: &ClassifyItem, categories: &[CategoryChoice]) -> String {
    let category_lines = categories
        .iter()
        .map(|category| format!("- {}: {}", category.id, category.name))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Categorize this financial transaction into exactly one of the listed \
         categories.\n\n\
         Transaction:\n\
         - description: {description}\n\
         - merchant: {merchant}\n\
         - amount in cents (negative is an expense): {amount}\n\n\
         Categories:\n{category_lines}\n\n\
         Reply with JSON only, no prose:\n\
         {{\"categoryId\": \"<id or null>\", \"confidence\": <0..1>, \"reasoning\": \"<one sentence>\"}}",
        description = item.description,
        merchant = item.merchant_raw,
        amount = item.amount,
    )
}

fn document_prompt(kind: DocumentKind) -> String {
    let receipt_clause = match kind {
        DocumentKind::Image => {
            "\nThis is a photographed receipt: also fill the \"receipt\" block with the \
             merchant and every line item."
        }
        _ => "",
    };

    format!(
        "Extract every financial transaction from this {kind} document.\n\
         Reply with JSON only, no prose, in this shape:\n\
         {{\"transactions\": [{{\"date\": \"YYYY-MM-DD\", \"amountCents\": -5000, \
         \"description\": \"...\", \"merchant\": \"...\"}}], \
         \"receipt\": {{\"merchant\": \"...\", \"lineItems\": [{{\"name\": \"...\", \
         \"quantity\": 1, \"unitPriceCents\": 450, \"totalPriceCents\": 450, \
         \"category\": null}}]}} or null}}\n\
         Amounts are integer cents, expenses negative.{receipt_clause}",
        kind = kind.as_str(),
    )
}

/// Strip a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();

    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);

    rest.trim()
}

/// Decode a JSON object out of model output: fences are stripped first,
/// and if the whole text is not JSON the outermost braced span is tried.
fn decode_json_object<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, String> {
    let cleaned = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }

    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            return serde_json::from_str(&cleaned[start..=end])
                .map_err(|error| format!("undecodable model output: {error}"));
        }
    }

    Err("model output carried no JSON object".to_owned())
}

/// Pull a confidence into `[0, 1]`; out-of-range or non-finite values
/// become 0.5.
pub fn coerce_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        confidence
    } else {
        0.5
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawClassification {
    #[serde(alias = "category")]
    category_id: Option<String>,
    confidence: Option<f64>,
    reasoning: Option<String>,
}

/// Shape a raw classification reply into a [Classification], validating
/// the picked category against the offered set.
pub fn parse_classification(
    text: &str,
    categories: &[CategoryChoice],
    model: Option<String>,
) -> Classification {
    let raw: RawClassification = match decode_json_object(text) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::debug!("classifier output rejected: {error}");
            return Classification::no_answer(error);
        }
    };

    let reasoning = raw.reasoning.unwrap_or_default();

    let category_id = raw.category_id.filter(|id| {
        let known = categories.iter().any(|category| category.id == *id);
        if !known {
            tracing::debug!("classifier picked unknown category '{id}'");
        }
        known
    });

    match category_id {
        Some(category_id) => Classification {
            category_id: Some(category_id),
            confidence: coerce_confidence(raw.confidence.unwrap_or(0.5)),
            reasoning,
            model,
            unavailable: false,
        },
        None => Classification {
            category_id: None,
            confidence: 0.0,
            reasoning,
            model,
            unavailable: false,
        },
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawDocTransaction {
    date: Option<String>,
    #[serde(alias = "amount")]
    amount_cents: Option<i64>,
    description: Option<String>,
    merchant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawReceiptItem {
    name: Option<String>,
    quantity: Option<f64>,
    #[serde(alias = "unitPrice")]
    unit_price_cents: Option<i64>,
    #[serde(alias = "totalPrice")]
    total_price_cents: Option<i64>,
    category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawReceipt {
    merchant: Option<String>,
    line_items: Vec<RawReceiptItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawParsedDocument {
    transactions: Vec<RawDocTransaction>,
    receipt: Option<RawReceipt>,
}

/// Shape a raw document-parse reply into a [ParsedDocument]. Rows with a
/// missing date, unreadable date, or zero amount are dropped.
///
/// # Errors
/// Returns [Error::ParseFailure] when the reply is not decodable JSON.
pub fn parse_document_text(text: &str) -> Result<ParsedDocument, Error> {
    let raw: RawParsedDocument = decode_json_object(text).map_err(Error::ParseFailure)?;

    let transactions = raw
        .transactions
        .into_iter()
        .filter_map(|row| {
            let posted_at = parse_flexible_date(row.date.as_deref()?.trim())?;
            let amount = row.amount_cents?;
            if amount == 0 {
                return None;
            }
            let description = row.description.unwrap_or_default();
            let merchant_raw = row.merchant.clone().unwrap_or_else(|| description.clone());

            Some(ParsedDocTransaction {
                posted_at,
                amount,
                description,
                merchant_raw,
            })
        })
        .collect();

    let receipt = raw.receipt.map(|receipt| ReceiptBlock {
        merchant: receipt.merchant,
        line_items: receipt
            .line_items
            .into_iter()
            .filter_map(|item| {
                Some(ReceiptLineItem {
                    name: item.name?,
                    quantity: item.quantity.unwrap_or(1.0),
                    unit_price: item.unit_price_cents.unwrap_or_default(),
                    total_price: item.total_price_cents?,
                    category: item.category,
                })
            })
            .collect(),
    });

    Ok(ParsedDocument {
        transactions,
        receipt,
    })
}
