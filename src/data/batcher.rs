// ============================================================
// Layer 4 — Utterance Batcher
// ============================================================
// Implements Burn's Batcher trait to turn a Vec<UtteranceSample>
// into one padded AsrBatch.
//
// What ends up in a batch:
//   wavs        [batch, samples]   zero-padded waveforms
//   tokens      [batch, L]         label ids
//   tokens_bos  [batch, L + 1]     BOS + label ids   (decoder input)
//   tokens_eos  [batch, L + 1]     label ids + EOS   (decoder target)
//
// Token matrices are padded with 0; the per-utterance lengths
// tell the losses which positions are real.
//
// Audio is read here rather than in the dataset, so the
// DataLoader's worker threads do the file I/O. A batch that
// cannot be read becomes a BatchError; the supervisor turns it
// into a fatal error.
//
// Reference: Burn Book §4 (Batcher)
//            Rust Book §8 (Vectors)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};
use thiserror::Error;

use crate::data::{audio::read_audio, dataset::UtteranceSample};
use crate::infra::label_encoder::SpecialTokens;

/// Failure to assemble a batch.
/// Clone so it can travel through Burn's DataLoader.
#[derive(Debug, Clone, Error)]
#[error("cannot build batch: {0}")]
pub struct BatchError(pub String);

// ─── AsrBatch ─────────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct AsrBatch<B: Backend> {
    /// Utterance ids, in batch order
    pub ids: Vec<String>,

    /// Waveforms, shape [batch, samples]
    pub wavs: Tensor<B, 2>,

    /// Unpadded sample count per utterance
    pub wav_lens: Vec<usize>,

    /// Label ids, shape [batch, max_len]
    pub tokens: Tensor<B, 2, Int>,

    pub token_lens: Vec<usize>,

    /// BOS-prefixed label ids, shape [batch, max_len + 1]
    pub tokens_bos: Tensor<B, 2, Int>,

    /// EOS-suffixed label ids, shape [batch, max_len + 1]
    pub tokens_eos: Tensor<B, 2, Int>,

    pub tokens_eos_lens: Vec<usize>,

    /// Host copy of the unpadded label ids (CTC targets)
    pub targets: Vec<Vec<usize>>,

    /// Reference transcripts
    pub words: Vec<String>,
}

impl<B: Backend> AsrBatch<B> {
    /// Assemble a batch from decoded audio and label sequences.
    /// Every waveform is padded to at least `min_samples`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ids:         Vec<String>,
        waveforms:   Vec<Vec<f32>>,
        targets:     Vec<Vec<usize>>,
        words:       Vec<String>,
        special:     SpecialTokens,
        min_samples: usize,
        device:      &B::Device,
    ) -> Result<Self, BatchError> {
        let batch_size = ids.len();
        if batch_size == 0 {
            return Err(BatchError("empty batch".into()));
        }
        if waveforms.len() != batch_size || targets.len() != batch_size || words.len() != batch_size {
            return Err(BatchError(format!(
                "mismatched batch parts: {} ids, {} waveforms, {} targets, {} transcripts",
                batch_size, waveforms.len(), targets.len(), words.len()
            )));
        }

        // ── Waveforms ─────────────────────────────────────────────────────────
        let wav_lens: Vec<usize> = waveforms.iter().map(Vec::len).collect();
        let samples = wav_lens.iter().copied().max().unwrap_or(0).max(min_samples);

        let mut flat = vec![0.0f32; batch_size * samples];
        for (row, wav) in waveforms.iter().enumerate() {
            flat[row * samples..row * samples + wav.len()].copy_from_slice(wav);
        }
        let wavs = Tensor::<B, 2>::from_data(TensorData::new(flat, [batch_size, samples]), device);

        // ── Token sequences ───────────────────────────────────────────────────
        let with_bos: Vec<Vec<usize>> = targets
            .iter()
            .map(|t| std::iter::once(special.bos).chain(t.iter().copied()).collect())
            .collect();
        let with_eos: Vec<Vec<usize>> = targets
            .iter()
            .map(|t| t.iter().copied().chain(std::iter::once(special.eos)).collect())
            .collect();

        let token_lens:      Vec<usize> = targets.iter().map(Vec::len).collect();
        let tokens_eos_lens: Vec<usize> = with_eos.iter().map(Vec::len).collect();

        for (i, id) in ids.iter().enumerate() {
            if with_bos[i].len() != token_lens[i] + 1 || tokens_eos_lens[i] != with_bos[i].len() {
                return Err(BatchError(format!("token sequences of '{id}' are inconsistent")));
            }
        }

        Ok(Self {
            tokens:     int_matrix(&targets, device),
            tokens_bos: int_matrix(&with_bos, device),
            tokens_eos: int_matrix(&with_eos, device),
            ids,
            wavs,
            wav_lens,
            token_lens,
            tokens_eos_lens,
            targets,
            words,
        })
    }

    pub fn len(&self) -> usize { self.ids.len() }

    pub fn is_empty(&self) -> bool { self.ids.is_empty() }

    /// Reference transcripts split into words
    pub fn target_words(&self) -> Vec<Vec<String>> {
        self.words
            .iter()
            .map(|w| w.split_whitespace().map(str::to_string).collect())
            .collect()
    }
}

/// Right-pad rows with 0 into a [rows, max_len] Int tensor.
/// A batch whose sequences are all empty still gets one column.
fn int_matrix<B: Backend>(rows: &[Vec<usize>], device: &B::Device) -> Tensor<B, 2, Int> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let mut flat = vec![0i64; rows.len() * width];
    for (r, row) in rows.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            flat[r * width + c] = v as i64;
        }
    }
    Tensor::<B, 2, Int>::from_data(TensorData::new(flat, [rows.len(), width]), device)
}

// ─── AsrBatcher ───────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct AsrBatcher<B: Backend> {
    pub device:      B::Device,
    pub special:     SpecialTokens,
    pub sample_rate: u32,
    /// Shortest padded waveform: one analysis frame
    pub min_samples: usize,
}

impl<B: Backend> AsrBatcher<B> {
    pub fn new(device: B::Device, special: SpecialTokens, sample_rate: u32, min_samples: usize) -> Self {
        Self { device, special, sample_rate, min_samples }
    }
}

impl<B: Backend> Batcher<UtteranceSample, Result<AsrBatch<B>, BatchError>> for AsrBatcher<B> {
    fn batch(&self, items: Vec<UtteranceSample>) -> Result<AsrBatch<B>, BatchError> {
        let mut ids       = Vec::with_capacity(items.len());
        let mut waveforms = Vec::with_capacity(items.len());
        let mut targets   = Vec::with_capacity(items.len());
        let mut words     = Vec::with_capacity(items.len());

        for item in items {
            let audio = read_audio(&item.wav, self.sample_rate)
                .map_err(|e| BatchError(format!("'{}': {e:#}", item.id)))?;
            ids.push(item.id);
            waveforms.push(audio);
            targets.push(item.tokens);
            words.push(item.words);
        }

        AsrBatch::new(ids, waveforms, targets, words, self.special, self.min_samples, &self.device)
    }
}

/// Batcher for a `BucketedDataset`: every item is already a
/// whole batch, so the loader runs with a batch size of 1.
#[derive(Clone, Debug)]
pub struct BucketBatcher<B: Backend>(pub AsrBatcher<B>);

impl<B: Backend> Batcher<Vec<UtteranceSample>, Result<AsrBatch<B>, BatchError>> for BucketBatcher<B> {
    fn batch(&self, items: Vec<Vec<UtteranceSample>>) -> Result<AsrBatch<B>, BatchError> {
        self.0.batch(items.into_iter().flatten().collect())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::path::Path;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn ints(t: Tensor<TestBackend, 2, Int>) -> Vec<i64> {
        t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    #[test]
    fn test_padding_and_shifted_tokens() {
        let device = Default::default();
        let batch  = AsrBatch::<TestBackend>::new(
            vec!["a".into(), "b".into()],
            vec![vec![0.5; 3], vec![0.25; 5]],
            vec![vec![3, 4], vec![5]],
            vec!["x y".into(), "z".into()],
            SpecialTokens::default(),
            4,
            &device,
        ).unwrap();

        assert_eq!(batch.wavs.dims(), [2, 5]);
        assert_eq!(batch.wav_lens, vec![3, 5]);
        assert_eq!(ints(batch.tokens.clone()), vec![3, 4, 5, 0]);
        assert_eq!(ints(batch.tokens_bos.clone()), vec![1, 3, 4, 1, 5, 0]);
        assert_eq!(ints(batch.tokens_eos.clone()), vec![3, 4, 2, 5, 2, 0]);
        assert_eq!(batch.token_lens, vec![2, 1]);
        assert_eq!(batch.tokens_eos_lens, vec![3, 2]);
        assert_eq!(batch.target_words()[0], vec!["x", "y"]);
    }

    #[test]
    fn test_short_audio_padded_to_one_frame() {
        let device = Default::default();
        let batch  = AsrBatch::<TestBackend>::new(
            vec!["a".into()], vec![vec![0.1; 2]], vec![vec![3]], vec!["x".into()],
            SpecialTokens::default(), 16, &device,
        ).unwrap();
        assert_eq!(batch.wavs.dims(), [1, 16]);
        assert_eq!(batch.wav_lens, vec![2]);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let device = Default::default();
        let result = AsrBatch::<TestBackend>::new(
            vec![], vec![], vec![], vec![], SpecialTokens::default(), 1, &device,
        );
        assert!(result.is_err());
    }

    fn write_wav(path: &Path, samples: &[i16]) {
        let spec = WavSpec {
            channels: 1, sample_rate: 16000, bits_per_sample: 16, sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn test_batcher_reads_audio() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("u.wav");
        write_wav(&wav, &[0, 100, 200, 300]);

        let batcher = AsrBatcher::<TestBackend>::new(Default::default(), SpecialTokens::default(), 16000, 2);
        let sample  = UtteranceSample { id: "u".into(), wav, words: "ab".into(), tokens: vec![3, 4], length: 0.25 };
        let batch   = batcher.batch(vec![sample]).unwrap();
        assert_eq!(batch.wavs.dims(), [1, 4]);
        assert_eq!(batch.ids, vec!["u"]);
    }

    #[test]
    fn test_bucket_batcher_flattens_planned_batch() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_wav(&a, &[0, 100, 200]);
        write_wav(&b, &[0, 100, 200, 300, 400]);
        let sample = |id: &str, wav: &Path| UtteranceSample {
            id: id.into(), wav: wav.to_path_buf(), words: "a".into(), tokens: vec![3], length: 0.1,
        };

        let batcher = BucketBatcher(AsrBatcher::<TestBackend>::new(Default::default(), SpecialTokens::default(), 16000, 2));
        let batch   = batcher.batch(vec![vec![sample("a", &a), sample("b", &b)]]).unwrap();
        assert_eq!(batch.ids, vec!["a", "b"]);
        assert_eq!(batch.wavs.dims(), [2, 5]);
    }

    #[test]
    fn test_batcher_missing_audio_is_error() {
        let batcher = AsrBatcher::<TestBackend>::new(Default::default(), SpecialTokens::default(), 16000, 2);
        let sample  = UtteranceSample {
            id: "u".into(), wav: "/nonexistent.wav".into(), words: "a".into(), tokens: vec![3], length: 1.0,
        };
        assert!(batcher.batch(vec![sample]).is_err());
    }
}
