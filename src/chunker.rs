//! Splitting raw data into pieces shaped like adaptive-bitrate video
//! segments.
//!
//! Video players fetch content in bursts: the first few segments are small
//! so playback starts quickly, steady-state segments are mid-sized, and an
//! occasional large segment covers a bitrate switch. [`Chunker`] reproduces
//! that size pattern so the tunnel's write sizes match what a DPI middlebox
//! expects from a video session.

use core::ops::Range;

use rand::{
    Rng, SeedableRng, TryRngCore,
    rngs::{OsRng, StdRng},
};

use crate::specification::MUX_PAYLOAD_MAX_LEN;

/// The three size bands the [`Chunker`] cycles through.
///
/// All bounds are in bytes; the upper bound of each band is exclusive.
/// No band may reach past the multiplexing frame's payload limit (65535),
/// since every chunk must fit in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkBands {
    /// Band used for the first [`fast_start_count`](Self::fast_start_count)
    /// chunks of every input.
    pub fast_start: Range<usize>,
    /// Steady-state band.
    pub normal: Range<usize>,
    /// Band used with probability [`peak_probability`](Self::peak_probability)
    /// after the fast-start phase.
    pub peak: Range<usize>,
    /// How many leading chunks draw from the fast-start band.
    pub fast_start_count: u32,
    /// Probability of drawing a peak-band chunk after the fast-start phase.
    pub peak_probability: f64,
}

impl Default for ChunkBands {
    fn default() -> Self {
        Self {
            fast_start: 4_000..9_000,
            normal: 18_000..42_000,
            peak: 48_000..64_000,
            fast_start_count: 3,
            peak_probability: 0.10,
        }
    }
}

impl ChunkBands {
    /// Checks the band invariants.
    ///
    /// # Panics
    /// Panics if any band is empty, starts at zero, or reaches past the
    /// frame payload limit, or if `peak_probability` is outside `[0, 1]`.
    pub(crate) fn validate(&self) {
        for band in [&self.fast_start, &self.normal, &self.peak] {
            assert!(band.start > 0, "chunk band must not produce empty chunks");
            assert!(band.start < band.end, "chunk band must not be empty");
            assert!(
                band.end <= MUX_PAYLOAD_MAX_LEN + 1,
                "chunk band must fit the frame payload limit"
            );
        }
        assert!(
            (0.0..=1.0).contains(&self.peak_probability),
            "peak_probability must be a probability"
        );
    }
}

/// Splits a raw byte buffer into video-segment-sized pieces.
///
/// The concatenation of the yielded chunks always equals the input exactly,
/// in order. Chunk sizes are random within the configured [`ChunkBands`];
/// the final chunk is clipped to the remaining byte count.
#[derive(Debug)]
pub struct Chunker {
    bands: ChunkBands,
    rng: StdRng,
}

impl Chunker {
    /// Creates a `Chunker` with the given bands, seeded from the system
    /// entropy source.
    ///
    /// # Panics
    /// Panics if `bands` violates the invariants listed on
    /// [`ChunkBands::validate`].
    pub fn new(bands: ChunkBands) -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self::with_bands_and_rng(bands, StdRng::from_seed(seed))
    }

    /// Creates a `Chunker` with the given bands and random source.
    ///
    /// This method can be used when you need to deterministically construct
    /// a `Chunker`, e.g. in tests.
    pub fn with_bands_and_rng(bands: ChunkBands, rng: StdRng) -> Self {
        bands.validate();
        Self { bands, rng }
    }

    /// Returns a lazy iterator over video-segment-sized slices of `data`.
    ///
    /// The sequence is not resumable mid-way; to restart, call `chunkify`
    /// again on the same input.
    pub fn chunkify<'a>(&mut self, data: &'a [u8]) -> Chunks<'a, '_> {
        Chunks {
            data,
            offset: 0,
            index: 0,
            bands: &self.bands,
            rng: &mut self.rng,
        }
    }
}

/// One slice of the original input, tagged with its position in the
/// sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk<'a> {
    /// Sequential position of this chunk within one `chunkify` call.
    pub index: u32,
    /// The slice of the original input this chunk covers.
    pub data: &'a [u8],
}

/// Iterator returned by [`Chunker::chunkify`].
#[derive(Debug)]
pub struct Chunks<'a, 'r> {
    data: &'a [u8],
    offset: usize,
    index: u32,
    bands: &'r ChunkBands,
    rng: &'r mut StdRng,
}

impl<'a> Iterator for Chunks<'a, '_> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.offset >= self.data.len() {
            return None;
        }

        let band = if self.index < self.bands.fast_start_count {
            &self.bands.fast_start
        } else if self.rng.random::<f64>() < self.bands.peak_probability {
            &self.bands.peak
        } else {
            &self.bands.normal
        };

        let remaining = self.data.len() - self.offset;
        let size = self
            .rng
            .random_range(band.clone())
            .min(MUX_PAYLOAD_MAX_LEN)
            .min(remaining);

        let chunk = Chunk {
            index: self.index,
            data: &self.data[self.offset..self.offset + size],
        };
        self.offset += size;
        self.index += 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn seeded(seed: u8) -> Chunker {
        Chunker::with_bands_and_rng(ChunkBands::default(), StdRng::from_seed([seed; 32]))
    }

    #[test]
    fn concatenation_reproduces_input() {
        let mut chunker = seeded(1);
        for len in [1usize, 100, 8_999, 9_000, 65_535, 1_000_000] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut rebuilt = Vec::with_capacity(len);
            for chunk in chunker.chunkify(&data) {
                assert!(!chunk.data.is_empty());
                rebuilt.extend_from_slice(chunk.data);
            }
            assert_eq!(rebuilt, data);
        }
    }

    #[test]
    fn bands_compare_by_value() {
        assert_eq!(ChunkBands::default(), ChunkBands::default());
        let wider = ChunkBands {
            peak_probability: 0.25,
            ..ChunkBands::default()
        };
        assert_ne!(wider, ChunkBands::default());
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let mut chunker = seeded(2);
        assert!(chunker.chunkify(&[]).next().is_none());
    }

    #[test]
    fn chunk_indices_are_sequential() {
        let mut chunker = seeded(3);
        let data = vec![0u8; 500_000];
        for (i, chunk) in chunker.chunkify(&data).enumerate() {
            assert_eq!(chunk.index as usize, i);
        }
    }

    #[test]
    fn sizes_respect_the_bands() {
        let bands = ChunkBands::default();
        let mut chunker = seeded(4);
        let data = vec![0u8; 2_000_000];

        let chunks: Vec<usize> = chunker.chunkify(&data).map(|c| c.data.len()).collect();
        let last = chunks.len() - 1;
        for (i, &size) in chunks.iter().enumerate() {
            assert!(size <= MUX_PAYLOAD_MAX_LEN);
            if i == last {
                // The final chunk is clipped to whatever remains.
                assert!(size <= bands.peak.end);
                continue;
            }
            if (i as u32) < bands.fast_start_count {
                assert!(bands.fast_start.contains(&size), "chunk {i}: {size}");
            } else {
                assert!(
                    bands.normal.contains(&size) || bands.peak.contains(&size),
                    "chunk {i}: {size}"
                );
            }
        }
    }

    #[test]
    fn peak_band_appears_with_roughly_expected_frequency() {
        let bands = ChunkBands::default();
        let mut chunker = seeded(5);
        // Large enough for a few hundred post-fast-start chunks.
        let data = vec![0u8; 8_000_000];

        let mut steady = 0usize;
        let mut peaks = 0usize;
        let chunks: Vec<usize> = chunker.chunkify(&data).map(|c| c.data.len()).collect();
        for &size in &chunks[bands.fast_start_count as usize..chunks.len() - 1] {
            steady += 1;
            if bands.peak.contains(&size) {
                peaks += 1;
            }
        }
        let ratio = peaks as f64 / steady as f64;
        assert!(ratio > 0.02 && ratio < 0.30, "peak ratio {ratio}");
    }

    #[test]
    #[should_panic(expected = "frame payload limit")]
    fn oversized_band_is_rejected() {
        let bands = ChunkBands {
            peak: 48_000..100_000,
            ..ChunkBands::default()
        };
        let _ = Chunker::with_bands_and_rng(bands, StdRng::from_seed([0u8; 32]));
    }
}
