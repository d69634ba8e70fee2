//! The per-object metadata envelope.
//!
//! A small key/value record attached to every ShardStream that lets a
//! later reader reverse the write: block size, chunk count, total object
//! length, and the erasure parameters that produced the shards. Integers
//! are decimal ASCII without leading zeros; `created` is RFC3339 with
//! nanosecond precision. Unknown keys round-trip verbatim through `extra`.

use crate::erasure::Technique;
use crate::error::{CoreError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

const KEY_BLOCK_SIZE: &str = "blockSize";
const KEY_CHUNK_COUNT: &str = "chunkCount";
const KEY_TOTAL_LENGTH: &str = "totalLength";
const KEY_ERASURE_K: &str = "erasureK";
const KEY_ERASURE_M: &str = "erasureM";
const KEY_ERASURE_TECHNIQUE: &str = "erasureTechnique";
const KEY_CREATED: &str = "created";

/// Object-reconstruction metadata, attached atomically with ShardStream
/// closure.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub block_size: u64,
    pub chunk_count: u64,
    pub total_length: u64,
    pub erasure_k: usize,
    pub erasure_m: usize,
    pub erasure_technique: Technique,
    pub created: DateTime<Utc>,
    /// Keys outside the recognized set, preserved verbatim.
    pub extra: HashMap<String, String>,
}

impl Envelope {
    /// Serialize to the key/value wire shape described in spec §3/§6.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(KEY_BLOCK_SIZE.to_string(), self.block_size.to_string());
        map.insert(KEY_CHUNK_COUNT.to_string(), self.chunk_count.to_string());
        map.insert(KEY_TOTAL_LENGTH.to_string(), self.total_length.to_string());
        map.insert(KEY_ERASURE_K.to_string(), self.erasure_k.to_string());
        map.insert(KEY_ERASURE_M.to_string(), self.erasure_m.to_string());
        map.insert(
            KEY_ERASURE_TECHNIQUE.to_string(),
            self.erasure_technique.as_str().to_string(),
        );
        map.insert(
            KEY_CREATED.to_string(),
            self.created.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        map
    }

    /// Parse from the wire shape. Fails `MalformedEnvelope` if a required
    /// key is missing or undecodable.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let block_size = parse_required_u64(map, KEY_BLOCK_SIZE)?;
        let chunk_count = parse_required_u64(map, KEY_CHUNK_COUNT)?;
        let total_length = parse_required_u64(map, KEY_TOTAL_LENGTH)?;
        let erasure_k = parse_required_usize(map, KEY_ERASURE_K)?;
        let erasure_m = parse_required_usize(map, KEY_ERASURE_M)?;

        let technique_str = required_str(map, KEY_ERASURE_TECHNIQUE)?;
        let erasure_technique = Technique::parse(technique_str)
            .map_err(|_| CoreError::MalformedEnvelope(format!(
                "unrecognized {KEY_ERASURE_TECHNIQUE}: {technique_str}"
            )))?;

        let created_str = required_str(map, KEY_CREATED)?;
        let created = DateTime::parse_from_rfc3339(created_str)
            .map_err(|e| {
                CoreError::MalformedEnvelope(format!("undecodable {KEY_CREATED}: {e}"))
            })?
            .with_timezone(&Utc);

        let known: &[&str] = &[
            KEY_BLOCK_SIZE,
            KEY_CHUNK_COUNT,
            KEY_TOTAL_LENGTH,
            KEY_ERASURE_K,
            KEY_ERASURE_M,
            KEY_ERASURE_TECHNIQUE,
            KEY_CREATED,
        ];
        let extra = map
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            block_size,
            chunk_count,
            total_length,
            erasure_k,
            erasure_m,
            erasure_technique,
            created,
            extra,
        })
    }
}

fn required_str<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CoreError::MalformedEnvelope(format!("missing required key: {key}")))
}

fn parse_required_u64(map: &HashMap<String, String>, key: &str) -> Result<u64> {
    let s = required_str(map, key)?;
    s.parse::<u64>()
        .map_err(|_| CoreError::MalformedEnvelope(format!("undecodable {key}: {s}")))
}

fn parse_required_usize(map: &HashMap<String, String>, key: &str) -> Result<usize> {
    let s = required_str(map, key)?;
    s.parse::<usize>()
        .map_err(|_| CoreError::MalformedEnvelope(format!("undecodable {key}: {s}")))
}
