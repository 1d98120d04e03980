// ============================================================
// Layer 4 — WAV Reader
// ============================================================
// Reads a WAV file into mono f32 samples in [-1, 1] with the
// hound crate. Multi-channel audio is averaged to mono.
//
// No resampling happens here: a file whose sample rate differs
// from the configured one is rejected so that a wrongly
// prepared corpus fails before training starts.

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};
use std::path::Path;

/// Load `path` as mono samples, requiring `expected_rate` Hz.
pub fn read_audio(path: &Path, expected_rate: u32) -> Result<Vec<f32>> {
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file '{}'", path.display()))?;

    let spec     = reader.spec();
    let channels = spec.channels.max(1) as usize;

    if spec.sample_rate != expected_rate {
        bail!(
            "'{}' is sampled at {} Hz, expected {} Hz",
            path.display(), spec.sample_rate, expected_rate
        );
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to read samples of '{}'", path.display()))?
                .chunks(channels)
                .map(|frame| {
                    let sum: i64 = frame.iter().map(|&s| s as i64).sum();
                    (sum as f32 / channels as f32) / max_val
                })
                .collect()
        }
        SampleFormat::Float => {
            reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to read samples of '{}'", path.display()))?
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        }
    };

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use tempfile::tempdir;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate:     rate,
            bits_per_sample: 16,
            sample_format:   SampleFormat::Int,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        for &s in frames {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn test_reads_mono_pcm() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 16000, 1, &[0, 16384, -16384]);
        let samples = read_audio(&path, 16000).unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[1] - 0.5).abs() < 1e-4);
        assert!((samples[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_stereo_is_averaged() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("s.wav");
        // one stereo frame: left 0.5, right 0.0
        write_wav(&path, 16000, 2, &[16384, 0]);
        let samples = read_audio(&path, 16000).unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_wrong_rate_rejected() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("r.wav");
        write_wav(&path, 44100, 1, &[0; 10]);
        assert!(read_audio(&path, 16000).is_err());
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(read_audio(Path::new("/nonexistent/x.wav"), 16000).is_err());
    }
}
