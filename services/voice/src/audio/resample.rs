use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Creates a mono resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Streams mono audio from a device rate to a fixed target rate.
///
/// The underlying resampler wants fixed-size input chunks, so samples that
/// do not fill a chunk are held until the next call.
pub struct MonoResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl MonoResampler {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(create_resampler(
                f64::from(from_rate),
                f64::from(to_rate),
                chunk_size,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Feeds `samples` and returns whatever output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut res) => output.append(&mut res[0]),
                Err(e) => tracing::warn!(error = %e, "Dropping audio the resampler rejected"),
            }
        }
        output
    }
}

/// Averages interleaved channels down to mono.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels.max(1));
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
        assert!(create_resampler(16000.0, 24000.0, 512).is_ok());
    }

    #[test]
    fn test_same_rate_passes_through() {
        let mut resampler = MonoResampler::new(16_000, 16_000, 512).unwrap();
        assert!(resampler.inner.is_none());
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_partial_chunks_are_held_back() {
        let mut resampler = MonoResampler::new(48_000, 16_000, 480).unwrap();
        assert!(resampler.process(&[0.0; 100]).is_empty());

        // One full input chunk at a third of the rate.
        let out = resampler.process(&[0.0; 380]);
        assert!(out.len().abs_diff(160) <= 2, "got {}", out.len());
    }

    #[test]
    fn test_downsampled_length_tracks_ratio() {
        let mut resampler = MonoResampler::new(48_000, 16_000, 480).unwrap();
        let mut total = 0;
        for _ in 0..10 {
            total += resampler.process(&[0.25; 480]).len();
        }
        assert!(total.abs_diff(1600) <= 4, "got {total}");
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let mono = to_mono(&[1.0, 0.0, 0.5, 0.5, -1.0, -0.5], 2);
        assert_eq!(mono.len(), 3);
        assert_abs_diff_eq!(mono[0], 0.5);
        assert_abs_diff_eq!(mono[1], 0.5);
        assert_abs_diff_eq!(mono[2], -0.75);
        assert_eq!(to_mono(&[0.3, 0.4], 1), vec![0.3, 0.4]);
    }
}
