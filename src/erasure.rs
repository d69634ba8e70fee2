//! The (K, M) erasure codec.
//!
//! A stateless transform between one DataUnit and its M shards:
//! `Codec::encode` turns `ℓ` bytes into M shards of `ceil(ℓ/K)` bytes each;
//! `Codec::decode` reconstructs the original `ℓ` bytes from any K of those
//! M shards. Padding up to `K * ceil(ℓ/K)` is internal and never exposed —
//! callers only ever see the unpadded length, carried separately in the
//! Envelope.

use crate::error::{CoreError, Result};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::fmt;

/// Matrix-construction technique recorded in the Envelope.
///
/// Both variants are validated and round-tripped faithfully, but both
/// currently route through the same `reed-solomon-erasure` matrix
/// construction — see DESIGN.md for why a second real implementation
/// isn't wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technique {
    Cauchy,
    Vandermonde,
}

impl Technique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Cauchy => "Cauchy",
            Technique::Vandermonde => "Vandermonde",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Cauchy" => Ok(Technique::Cauchy),
            "Vandermonde" => Ok(Technique::Vandermonde),
            other => Err(CoreError::InvalidParameters(format!(
                "unknown erasure technique: {other}"
            ))),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validated (K, M, technique) parameter triple.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub k: usize,
    pub m: usize,
    pub technique: Technique,
}

impl Params {
    /// Validate and construct a parameter triple.
    ///
    /// Fails `InvalidParameters` if `k == 0` or `m < k`.
    pub fn new(k: usize, m: usize, technique: Technique) -> Result<Self> {
        if k == 0 {
            return Err(CoreError::InvalidParameters(
                "erasureK must be > 0".to_string(),
            ));
        }
        if m < k {
            return Err(CoreError::InvalidParameters(format!(
                "erasureM ({m}) must be >= erasureK ({k})"
            )));
        }
        Ok(Self { k, m, technique })
    }

    fn parity_shards(&self) -> usize {
        self.m - self.k
    }
}

/// Stateless Reed-Solomon codec bound to one `Params` triple.
pub struct Codec {
    params: Params,
    // `ReedSolomon::new` rejects parity_shards == 0, so the all-data-shard
    // case (K == M, no parity) is handled without a coder at all.
    coder: Option<ReedSolomon>,
}

impl Codec {
    pub fn new(params: Params) -> Result<Self> {
        let coder = if params.parity_shards() == 0 {
            None
        } else {
            Some(ReedSolomon::new(params.k, params.parity_shards())?)
        };
        Ok(Self { params, coder })
    }

    pub fn params(&self) -> Params {
        self.params
    }

    /// Size of each shard for a DataUnit of length `data_len`.
    pub fn shard_size(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.params.k)
    }

    /// Encode one DataUnit into `M` equal-length shards.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.encode_inner(data, false)
    }

    /// Parallel variant of [`Codec::encode`], worthwhile above a few MiB.
    pub fn encode_parallel(&self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.encode_inner(data, true)
    }

    fn encode_inner(&self, data: &[u8], parallel: bool) -> Result<Vec<Bytes>> {
        let shard_size = self.shard_size(data.len());
        let padded_size = shard_size * self.params.k;
        let mut padded = data.to_vec();
        padded.resize(padded_size, 0);

        let mut shards: Vec<Vec<u8>> = if parallel {
            padded.par_chunks(shard_size).map(|c| c.to_vec()).collect()
        } else {
            padded.chunks(shard_size).map(|c| c.to_vec()).collect()
        };
        for _ in 0..self.params.parity_shards() {
            shards.push(vec![0u8; shard_size]);
        }

        if let Some(coder) = &self.coder {
            coder.encode(&mut shards)?;
        }

        Ok(shards.into_iter().map(Bytes::from).collect())
    }

    /// Reconstruct a DataUnit of `original_len` bytes from `shards`, where
    /// `shards[i]` is `None` for a missing/unavailable node.
    ///
    /// Fails `InsufficientShards` if fewer than K entries are present,
    /// `ShardLengthMismatch` if present shards differ in length.
    pub fn decode(&self, shards: &[Option<Bytes>], original_len: usize) -> Result<Bytes> {
        if shards.len() != self.params.m {
            return Err(CoreError::ShardLengthMismatch {
                expected: self.params.m,
                actual: shards.len(),
            });
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.params.k {
            return Err(CoreError::InsufficientShards {
                available,
                required: self.params.k,
            });
        }

        let shard_size = shards
            .iter()
            .find_map(|s| s.as_ref().map(|b| b.len()))
            .expect("available > 0 implies at least one shard");
        for shard in shards.iter().flatten() {
            if shard.len() != shard_size {
                return Err(CoreError::ShardLengthMismatch {
                    expected: shard_size,
                    actual: shard.len(),
                });
            }
        }

        let mut shard_vecs: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|opt| opt.as_ref().map(|b| b.to_vec()))
            .collect();

        if let Some(coder) = &self.coder {
            coder.reconstruct(&mut shard_vecs)?;
        }

        let mut result = Vec::with_capacity(shard_size * self.params.k);
        for shard_opt in shard_vecs.iter().take(self.params.k) {
            match shard_opt {
                Some(shard) => result.extend_from_slice(shard),
                None => {
                    return Err(CoreError::DecodeFailure(
                        "reconstruction left a data shard missing".to_string(),
                    ))
                }
            }
        }

        result.truncate(original_len);
        Ok(Bytes::from(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(k: usize, m: usize) -> Codec {
        Codec::new(Params::new(k, m, Technique::Cauchy).unwrap()).unwrap()
    }

    #[test]
    fn test_params_rejects_zero_k() {
        assert!(Params::new(0, 4, Technique::Cauchy).is_err());
    }

    #[test]
    fn test_params_rejects_m_less_than_k() {
        assert!(Params::new(8, 4, Technique::Cauchy).is_err());
    }

    #[test]
    fn test_technique_parse_roundtrip() {
        assert_eq!(Technique::parse("Cauchy").unwrap(), Technique::Cauchy);
        assert_eq!(
            Technique::parse("Vandermonde").unwrap(),
            Technique::Vandermonde
        );
        assert!(Technique::parse("cauchy").is_err());
        assert!(Technique::parse("RAID6").is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = codec(8, 8);
        let original = b"hello, donut!";

        let shards = codec.encode(original).unwrap();
        assert_eq!(shards.len(), 8);
        for shard in &shards {
            assert_eq!(shard.len(), original.len().div_ceil(8));
        }

        let available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
        let decoded = codec.decode(&available, original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original);
    }

    #[test]
    fn test_decode_tolerates_missing_shards() {
        let codec = codec(8, 16);
        let original = vec![7u8; 1024 * 1024];

        let shards = codec.encode(&original).unwrap();
        let mut available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
        for i in [0, 2, 9, 15] {
            available[i] = None;
        }

        let decoded = codec.decode(&available, original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original.as_slice());
    }

    #[test]
    fn test_decode_fails_below_threshold() {
        let codec = codec(8, 16);
        let original = b"not enough shards";
        let shards = codec.encode(original).unwrap();

        let mut available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
        for slot in available.iter_mut().take(9) {
            *slot = None;
        }

        let result = codec.decode(&available, original.len());
        assert!(matches!(result, Err(CoreError::InsufficientShards { .. })));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let codec = codec(4, 4);
        let original = b"mismatch test data";
        let mut shards = codec.encode(original).unwrap();
        shards[0] = Bytes::from(vec![0u8; shards[0].len() + 1]);

        let available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
        let result = codec.decode(&available, original.len());
        assert!(matches!(
            result,
            Err(CoreError::ShardLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_sequential_and_parallel_encode_agree() {
        let codec = codec(8, 14);
        let original = vec![42u8; 10 * 1024 * 1024];

        let seq = codec.encode(&original).unwrap();
        let par = codec.encode_parallel(&original).unwrap();
        assert_eq!(seq, par);
    }

    #[test]
    fn test_k_equals_m_no_parity() {
        let codec = codec(4, 4);
        let original = b"k equals m, no parity shards";
        let shards = codec.encode(original).unwrap();
        assert_eq!(shards.len(), 4);

        let available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
        let decoded = codec.decode(&available, original.len()).unwrap();
        assert_eq!(decoded.as_ref(), original);
    }

    #[test]
    fn test_empty_data_unit() {
        let codec = codec(8, 8);
        let shards = codec.encode(b"").unwrap();
        assert_eq!(shards.len(), 8);
        assert!(shards.iter().all(|s| s.is_empty()));

        let available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
        let decoded = codec.decode(&available, 0).unwrap();
        assert!(decoded.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// (k, m) pairs with `0 < k <= m <= 8`, small enough to keep
        /// `ReedSolomon::new` cheap across hundreds of proptest cases.
        fn km_strategy() -> impl Strategy<Value = (usize, usize)> {
            (1usize..=8).prop_flat_map(|k| (Just(k), k..=8))
        }

        proptest! {
            /// P1: decode(encode(X)) == X for arbitrary data and (K, M).
            #[test]
            fn prop_round_trip_with_all_shards(
                (k, m) in km_strategy(),
                data in proptest::collection::vec(any::<u8>(), 0..4096),
            ) {
                let codec = codec(k, m);
                let shards = codec.encode(&data).unwrap();
                let available: Vec<Option<Bytes>> = shards.into_iter().map(Some).collect();
                let decoded = codec.decode(&available, data.len()).unwrap();
                prop_assert_eq!(decoded.as_ref(), data.as_slice());
            }

            /// P3: every shard for a DataUnit has length ceil(len/K), and
            /// all M shards at that ChunkIndex agree in length.
            #[test]
            fn prop_shard_lengths_are_uniform_and_ceil_div(
                (k, m) in km_strategy(),
                data in proptest::collection::vec(any::<u8>(), 0..4096),
            ) {
                let codec = codec(k, m);
                let shards = codec.encode(&data).unwrap();
                let expected = data.len().div_ceil(k);
                prop_assert_eq!(shards.len(), m);
                for shard in &shards {
                    prop_assert_eq!(shard.len(), expected);
                }
            }

            /// P2 (codec layer): any K of M shards suffice; any fewer fail
            /// InsufficientShards rather than fabricating bytes.
            #[test]
            fn prop_any_k_of_m_shards_suffice(
                (k, m) in km_strategy(),
                data in proptest::collection::vec(any::<u8>(), 1..4096),
                seed in any::<u64>(),
            ) {
                let codec = codec(k, m);
                let shards = codec.encode(&data).unwrap();

                // Deterministic pseudo-random drop pattern from `seed`,
                // keeping exactly k of m shards.
                let mut order: Vec<usize> = (0..m).collect();
                let mut state = seed | 1;
                for i in (1..order.len()).rev() {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let j = (state as usize) % (i + 1);
                    order.swap(i, j);
                }
                let kept: std::collections::HashSet<usize> =
                    order.into_iter().take(k).collect();

                let available: Vec<Option<Bytes>> = shards
                    .iter()
                    .enumerate()
                    .map(|(i, s)| if kept.contains(&i) { Some(s.clone()) } else { None })
                    .collect();
                let decoded = codec.decode(&available, data.len()).unwrap();
                prop_assert_eq!(decoded.as_ref(), data.as_slice());

                if k > 1 {
                    let mut too_few = available.clone();
                    let first_present = too_few.iter().position(Option::is_some).unwrap();
                    too_few[first_present] = None;
                    let result = codec.decode(&too_few, data.len());
                    prop_assert!(matches!(result, Err(CoreError::InsufficientShards { .. })));
                }
            }
        }
    }
}
