use crate::model::RejectionReason;
use regex::Regex;
use std::sync::OnceLock;

/// Extra sats added on top of a detected funding/capacity overhead so the
/// next attempt does not under-fund again.
const OVERHEAD_SAFETY_BUFFER_SATS: u64 = 10_000;

/// A remote error as received from the node, before normalization.
///
/// Node transports surface failures in several shapes: a bare message, a
/// structured exception, or a `[code, message, context]` triple. Unknown
/// shapes are carried as raw JSON and stringified.
#[derive(Debug, Clone)]
pub enum RemoteError {
    Message(String),
    Structured { name: String, message: String },
    Coded { code: i64, message: String, context: Option<serde_json::Value> },
    Json(serde_json::Value),
}

impl RemoteError {
    /// Collapse to a single canonical message string for classification.
    pub fn normalize(&self) -> String {
        match self {
            RemoteError::Message(msg) => msg.clone(),
            RemoteError::Structured { name, message } => format!("{}: {}", name, message),
            RemoteError::Coded { code, message, context } => match context {
                Some(ctx) => format!("{} (code {}): {}", message, code, ctx),
                None => format!("{} (code {})", message, code),
            },
            RemoteError::Json(value) => value.to_string(),
        }
    }
}

impl From<&anyhow::Error> for RemoteError {
    fn from(err: &anyhow::Error) -> Self {
        RemoteError::Message(format!("{:#}", err))
    }
}

/// Classification of a remote open failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub reason: RejectionReason,
    /// Detected minimum channel size, for min_channel_size rejections.
    pub min_size: Option<u64>,
    /// The normalized message, kept for the rejection record.
    pub details: String,
    /// Implicated peer, when the message names one. Absence means the
    /// failure is batch-wide and not attributable.
    pub pubkey: Option<String>,
}

struct Patterns {
    pubkey: Regex,
    below_btc: Regex,
    below_sat: Regex,
    generic_min: Regex,
    chan_size: Regex,
    funding: Regex,
    capacity: Regex,
    connect: Regex,
    offline: Regex,
    no_address: Regex,
    reject: Regex,
    anchors: Regex,
    pending: Regex,
    internal: Regex,
    error_token: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        pubkey: Regex::new(r"\b(0[23][0-9a-fA-F]{64})\b").unwrap(),
        below_btc: Regex::new(r"(?i)below[a-z ]*?([0-9]+(?:\.[0-9]+)?)\s*btc").unwrap(),
        below_sat: Regex::new(r"(?i)below[a-z ]*?([0-9]+)\s*sat").unwrap(),
        generic_min: Regex::new(r"(?i)(?:minimum|at least)[a-z :]*?([0-9]+)").unwrap(),
        chan_size: Regex::new(r"(?i)chan(?:nel)?[ _-]?size[a-z :]*?([0-9]+(?:\.[0-9]+)?)(\s*btc)?")
            .unwrap(),
        funding: Regex::new(r"(?i)funding\s*([0-9]+)\s*sat").unwrap(),
        capacity: Regex::new(r"(?i)channel capacity is\s*([0-9]+)\s*sat").unwrap(),
        connect: Regex::new(r"(?i)connect|dial|timed?[ -]?out|timeout|\btor\b|proxy").unwrap(),
        offline: Regex::new(r"(?i)offline|not online").unwrap(),
        no_address: Regex::new(r"(?i)no[ _-]?(?:known\s+)?address|no[ _-]?route|unable to locate")
            .unwrap(),
        reject: Regex::new(r"(?i)reject|denie[ds]|\bdeny\b|refus").unwrap(),
        anchors: Regex::new(r"(?i)anchor|feature").unwrap(),
        pending: Regex::new(r"(?i)pending channels exceed maximum").unwrap(),
        internal: Regex::new(r"(?i)remote cancel|cancell?ed|internal error|funding failed").unwrap(),
        error_token: Regex::new(r"(?i)\berror\b").unwrap(),
    })
}

/// Normalize a remote error and classify it against the ordered rule list.
///
/// Rule order is a correctness requirement: minimum-size patterns carry
/// units and figures that the generic token rules would otherwise swallow.
pub fn parse_open_error(err: &RemoteError) -> ClassifiedError {
    classify_message(&err.normalize())
}

fn classify_message(msg: &str) -> ClassifiedError {
    let p = patterns();

    let pubkey = p
        .pubkey
        .captures(msg)
        .map(|c| c[1].to_ascii_lowercase());

    if let Some(min) = detect_minimum(msg) {
        return ClassifiedError {
            reason: RejectionReason::MinChannelSize,
            min_size: Some(apply_overhead_correction(msg, min)),
            details: msg.to_string(),
            pubkey,
        };
    }

    let reason = if p.connect.is_match(msg) {
        RejectionReason::FailedToConnect
    } else if p.offline.is_match(msg) {
        RejectionReason::NotOnline
    } else if p.no_address.is_match(msg) {
        RejectionReason::NoAddress
    } else if p.reject.is_match(msg) {
        RejectionReason::Rejected
    } else if p.anchors.is_match(msg) {
        RejectionReason::NoAnchors
    } else if p.pending.is_match(msg) {
        RejectionReason::TooManyPending
    } else if p.internal.is_match(msg) || p.error_token.is_match(msg) {
        RejectionReason::InternalError
    } else {
        RejectionReason::Rejected
    };

    ClassifiedError {
        reason,
        min_size: None,
        details: msg.to_string(),
        pubkey,
    }
}

/// Minimum-size detection, most specific unit first.
fn detect_minimum(msg: &str) -> Option<u64> {
    let p = patterns();

    if let Some(caps) = p.below_btc.captures(msg) {
        return caps[1].parse::<f64>().ok().map(btc_to_sats);
    }
    if let Some(caps) = p.below_sat.captures(msg) {
        return caps[1].parse::<u64>().ok();
    }
    if let Some(caps) = p.generic_min.captures(msg) {
        return caps[1].parse::<u64>().ok();
    }
    if let Some(caps) = p.chan_size.captures(msg) {
        let value = &caps[1];
        return if caps.get(2).is_some() {
            value.parse::<f64>().ok().map(btc_to_sats)
        } else {
            value.parse::<u64>().ok()
        };
    }
    None
}

fn btc_to_sats(btc: f64) -> u64 {
    (btc * 100_000_000.0).round() as u64
}

/// If the message carries both a funding figure and a resulting channel
/// capacity, the difference is reserve/fee overhead invisible in the peer's
/// nominal minimum. Compensate so the next plan does not under-fund again.
fn apply_overhead_correction(msg: &str, min: u64) -> u64 {
    let p = patterns();
    let funding = p.funding.captures(msg).and_then(|c| c[1].parse::<u64>().ok());
    let capacity = p.capacity.captures(msg).and_then(|c| c[1].parse::<u64>().ok());
    match (funding, capacity) {
        (Some(f), Some(c)) if f > c => min + (f - c) + OVERHEAD_SAFETY_BUFFER_SATS,
        _ => min,
    }
}
