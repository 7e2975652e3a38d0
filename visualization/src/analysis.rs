//! Frequency analysis of cached PCM
//!
//! A [`FrequencyAnalyzer`] pulls a window of frames out of a [`RingCache`],
//! runs one forward FFT per channel and summarizes the configured frequency
//! range as bass, mids and trebs. The serializers write the results in the
//! byte layout of a FRAME payload: big-endian integers and IEEE-754 floats.

use crate::cache::RingCache;
use bytes::BufMut;
use log::{debug, warn};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;
use std::time::Instant;
use vis_core::Error;

/// Largest window that can be described in a FRAME
pub const MAX_NUM_SAMPLES: usize = u16::MAX as usize;

/// Fixed part of a FRAME payload
const PAYLOAD_HEADER_LEN: usize = 17;

/// Analysis settings independent of the audio format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisParameters {
    num_samples: usize,
    lo_cutoff: f32,
    hi_cutoff: f32,
}

impl AnalysisParameters {
    pub const DEFAULT_NUM_SAMPLES: usize = 513;
    pub const DEFAULT_LO_CUTOFF: f32 = 200.0;
    pub const DEFAULT_HI_CUTOFF: f32 = 10000.0;

    /// Validate and collect analysis settings.
    ///
    /// `num_samples` is the number of frames per analysis window; the cutoffs
    /// are in Hz and must satisfy `lo_cutoff < hi_cutoff`.
    pub fn new(num_samples: usize, lo_cutoff: f32, hi_cutoff: f32) -> Result<Self, Error> {
        if num_samples == 0 || num_samples > MAX_NUM_SAMPLES {
            return Err(Error::Analysis(format!(
                "num_samples ({}) must be between 1 and {}",
                num_samples, MAX_NUM_SAMPLES
            )));
        }
        if !(0.0..hi_cutoff).contains(&lo_cutoff) {
            return Err(Error::Analysis(format!(
                "lo_cutoff ({}) must be less than hi_cutoff ({})",
                lo_cutoff, hi_cutoff
            )));
        }

        Ok(Self {
            num_samples,
            lo_cutoff,
            hi_cutoff,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn lo_cutoff(&self) -> f32 {
        self.lo_cutoff
    }

    pub fn hi_cutoff(&self) -> f32 {
        self.hi_cutoff
    }
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            num_samples: Self::DEFAULT_NUM_SAMPLES,
            lo_cutoff: Self::DEFAULT_LO_CUTOFF,
            hi_cutoff: Self::DEFAULT_HI_CUTOFF,
        }
    }
}

/// Per-session spectrum analyzer over a shared [`RingCache`].
pub struct FrequencyAnalyzer {
    cache: Arc<RingCache>,
    num_samples: usize,
    /// Stored coefficients per channel, `num_samples / 2 + 1`
    out_samples: usize,
    num_channels: usize,
    sample_rate: u32,

    /// Raw interleaved PCM for one window
    raw: Vec<u8>,
    /// Normalized samples, channel-major
    waveforms: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// First `out_samples` bins of every channel, channel-major
    coeffs: Vec<Complex<f32>>,
    /// `[bass, mids, trebs]` per channel
    bass_mids_trebs: Vec<f32>,

    freq_lo: f32,
    freq_hi: f32,
    idx_lo: usize,
    idx_hi: usize,
    idx_mids: usize,
    idx_trebs: usize,
}

impl FrequencyAnalyzer {
    pub fn new(params: &AnalysisParameters, cache: Arc<RingCache>) -> Result<Self, Error> {
        let format = cache.format();
        let num_samples = params.num_samples();
        let num_channels = format.channels as usize;

        if num_samples == 0 || num_samples > MAX_NUM_SAMPLES {
            return Err(Error::Analysis(format!(
                "num_samples ({}) must be between 1 and {}",
                num_samples, MAX_NUM_SAMPLES
            )));
        }
        if format.sample_rate > u16::MAX as u32 {
            return Err(Error::Analysis(format!(
                "Sample rate {} can't be described in a frame",
                format.sample_rate
            )));
        }

        let samples_per_sec = format.sample_rate as f32;
        let ns = num_samples as f32;

        let freq_lo = params.lo_cutoff();
        // Highest frequency we'll report
        let max_freq = samples_per_sec;
        let freq_hi = if max_freq < params.hi_cutoff() {
            warn!(
                "Clamping max frequency from {} to {}",
                params.hi_cutoff(),
                max_freq
            );
            max_freq
        } else {
            params.hi_cutoff()
        };
        if freq_lo >= freq_hi {
            return Err(Error::Analysis(format!(
                "lo_cutoff ({}) is not below the highest usable frequency ({})",
                freq_lo, freq_hi
            )));
        }

        let idx_lo = (freq_lo * ns / samples_per_sec).floor() as usize;
        let idx_hi = (freq_hi * ns / samples_per_sec).ceil() as usize;

        let num_octaves = (freq_hi / freq_lo).ln() / std::f32::consts::LN_2;
        let freq_mids = freq_lo * 2.0f32.powf(num_octaves / 3.0);
        let freq_trebs = freq_lo * 2.0f32.powf(2.0 * num_octaves / 3.0);
        let idx_mids = (ns * freq_mids / samples_per_sec) as usize;
        let idx_trebs = (ns * freq_trebs / samples_per_sec) as usize;

        let num_freq = idx_hi - idx_lo;
        let payload_len = Self::payload_len_for(num_channels, num_samples, num_freq);
        if payload_len > u16::MAX as usize {
            return Err(Error::Analysis(format!(
                "A frame of {} samples x {} channels with {} frequencies needs {} bytes, \
                 more than a frame can carry",
                num_samples, num_channels, num_freq, payload_len
            )));
        }

        let fft = FftPlanner::<f32>::new().plan_fft_forward(num_samples);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let out_samples = num_samples / 2 + 1;

        debug!(
            "New analyzer: {} samples x {} channels @ {}Hz, [{}Hz, {}Hz] -> bins [{}, {}), mids {}, trebs {}",
            num_samples,
            num_channels,
            format.sample_rate,
            freq_lo,
            freq_hi,
            idx_lo,
            idx_hi,
            idx_mids,
            idx_trebs
        );

        Ok(Self {
            num_samples,
            out_samples,
            num_channels,
            sample_rate: format.sample_rate,
            raw: vec![0; num_samples * format.frame_size()],
            waveforms: vec![0.0; num_samples * num_channels],
            fft,
            fft_buffer: vec![Complex::new(0.0, 0.0); num_samples * num_channels],
            scratch,
            coeffs: vec![Complex::new(0.0, 0.0); out_samples * num_channels],
            bass_mids_trebs: vec![0.0; 3 * num_channels],
            cache,
            freq_lo,
            freq_hi,
            idx_lo,
            idx_hi,
            idx_mids,
            idx_trebs,
        })
    }

    /// Analyze the window of frames ending at `t`.
    ///
    /// Returns `false`, leaving the previous results in place, when the cache
    /// can't supply that window.
    pub fn update(&mut self, t: Instant) -> bool {
        if !self.cache.get_by_time(self.num_samples, t, &mut self.raw) {
            debug!(
                "No window of {} samples available for analysis ({} bytes cached)",
                self.num_samples,
                self.cache.size()
            );
            return false;
        }

        let format = self.cache.format().format;
        let sample_size = format.sample_size();
        let n = self.num_samples;
        let nch = self.num_channels;

        // Interleaved -> channel-major
        for (i, frame) in self.raw.chunks_exact(sample_size * nch).enumerate() {
            for (j, sample) in frame.chunks_exact(sample_size).enumerate() {
                self.waveforms[j * n + i] = format.to_float(sample);
            }
        }

        for (dst, &x) in self.fft_buffer.iter_mut().zip(&self.waveforms) {
            *dst = Complex::new(x, 0.0);
        }
        // Transforms every `n`-long chunk, one per channel
        self.fft
            .process_with_scratch(&mut self.fft_buffer, &mut self.scratch);

        for c in 0..nch {
            self.coeffs[c * self.out_samples..(c + 1) * self.out_samples]
                .copy_from_slice(&self.fft_buffer[c * n..c * n + self.out_samples]);
        }

        let max_coeffs_idx = n / 2;
        for c in 0..nch {
            let chan = &self.coeffs[c * self.out_samples..(c + 1) * self.out_samples];
            let mut bmt = [0.0f32; 3];
            for i in self.idx_lo..self.idx_hi {
                let j = if i > max_coeffs_idx { n - i } else { i };
                let contrib = chan[j].norm();
                if i < self.idx_mids {
                    bmt[0] += contrib;
                } else if i < self.idx_trebs {
                    bmt[1] += contrib;
                } else {
                    bmt[2] += contrib;
                }
            }
            self.bass_mids_trebs[3 * c..3 * c + 3].copy_from_slice(&bmt);
        }

        true
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Number of frequencies reported per channel
    pub fn num_freq(&self) -> usize {
        self.idx_hi - self.idx_lo
    }

    pub fn freq_lo(&self) -> f32 {
        self.freq_lo
    }

    pub fn freq_hi(&self) -> f32 {
        self.freq_hi
    }

    pub fn idx_lo(&self) -> usize {
        self.idx_lo
    }

    pub fn idx_hi(&self) -> usize {
        self.idx_hi
    }

    pub fn idx_mids(&self) -> usize {
        self.idx_mids
    }

    pub fn idx_trebs(&self) -> usize {
        self.idx_trebs
    }

    /// Copy all stored coefficients, `num_samples / 2 + 1` per channel with no
    /// frequency cutoffs applied.
    pub fn get_coeffs(&self, out: &mut [Complex<f32>]) -> bool {
        if out.len() < self.coeffs.len() {
            return false;
        }
        out[..self.coeffs.len()].copy_from_slice(&self.coeffs);
        true
    }

    pub fn get_bass_mids_trebs(&self, out: &mut [f32]) -> bool {
        if out.len() < self.bass_mids_trebs.len() {
            return false;
        }
        out[..self.bass_mids_trebs.len()].copy_from_slice(&self.bass_mids_trebs);
        true
    }

    pub fn serialize_waveforms<B: BufMut>(&self, buf: &mut B) {
        for &x in &self.waveforms {
            buf.put_f32(x);
        }
    }

    /// Coefficients `[idx_lo, idx_hi)` of every channel as `(re, im)` pairs
    pub fn serialize_coefficients<B: BufMut>(&self, buf: &mut B) {
        self.transform_coeffs(|c| {
            buf.put_f32(c.re);
            buf.put_f32(c.im);
        });
    }

    /// Magnitudes of coefficients `[idx_lo, idx_hi)` of every channel
    pub fn serialize_power_spectra<B: BufMut>(&self, buf: &mut B) {
        self.transform_coeffs(|c| buf.put_f32(c.norm()));
    }

    pub fn serialize_bass_mids_trebs<B: BufMut>(&self, buf: &mut B) {
        for &x in &self.bass_mids_trebs {
            buf.put_f32(x);
        }
    }

    /// Write a complete FRAME payload for the latest analysis.
    pub fn serialize_frame_payload<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.num_samples as u16);
        buf.put_u8(self.num_channels as u8);
        buf.put_u16(self.sample_rate as u16);
        self.serialize_waveforms(buf);
        buf.put_u16(self.num_freq() as u16);
        buf.put_f32(self.freq_lo);
        buf.put_f32(self.freq_hi);
        buf.put_u16(self.idx_lo as u16);
        self.serialize_coefficients(buf);
        self.serialize_power_spectra(buf);
        self.serialize_bass_mids_trebs(buf);
    }

    /// Size in bytes of [`serialize_frame_payload`](Self::serialize_frame_payload)'s output
    pub fn payload_len(&self) -> usize {
        Self::payload_len_for(self.num_channels, self.num_samples, self.num_freq())
    }

    fn payload_len_for(num_channels: usize, num_samples: usize, num_freq: usize) -> usize {
        PAYLOAD_HEADER_LEN + 4 * num_channels * (num_samples + 3 * num_freq + 3)
    }

    /// Visit coefficients `[idx_lo, idx_hi)` channel by channel.
    ///
    /// Only the first `num_samples / 2 + 1` bins are stored; indices past
    /// that are produced from the stored half as complex conjugates.
    fn transform_coeffs<F: FnMut(Complex<f32>)>(&self, mut op: F) {
        let total = self.out_samples;
        let upper = self.idx_hi.min(total);

        let mut second_off = if self.num_samples % 2 != 0 { 1 } else { 2 };
        if self.idx_lo > upper {
            second_off += self.idx_lo - upper;
        }

        for chan in 0..self.num_channels {
            let first = chan * total;

            let mut num_to_copy = self.idx_hi - self.idx_lo;
            for i in self.idx_lo..upper {
                op(self.coeffs[first + i]);
                num_to_copy -= 1;
            }

            if self.idx_hi > total {
                for j in 0..num_to_copy {
                    let c = (first + total)
                        .checked_sub(second_off + j)
                        .and_then(|k| self.coeffs.get(k))
                        .map(|c| c.conj())
                        .unwrap_or_default();
                    op(c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vis_core::{AudioFormat, SampleFormat};

    const EPS: f32 = 1e-3;

    fn float_cache(rate: u32, channels: u8, frames: &[f32], span: Duration) -> Arc<RingCache> {
        let fmt = AudioFormat::new(rate, SampleFormat::Float, channels);
        let cache = RingCache::new(fmt, span).expect("Failed to create cache");
        let bytes: Vec<u8> = frames.iter().flat_map(|x| x.to_ne_bytes()).collect();
        cache.add(&bytes);
        Arc::new(cache)
    }

    fn newest(cache: &RingCache) -> Instant {
        cache.range().expect("Cache should hold data").1
    }

    fn decode_floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    fn naive_dft(x: &[f32]) -> Vec<Complex<f32>> {
        let n = x.len();
        (0..n)
            .map(|k| {
                let mut acc = (0.0f64, 0.0f64);
                for (m, &v) in x.iter().enumerate() {
                    let phi = -std::f64::consts::TAU * (k * m) as f64 / n as f64;
                    acc.0 += v as f64 * phi.cos();
                    acc.1 += v as f64 * phi.sin();
                }
                Complex::new(acc.0 as f32, acc.1 as f32)
            })
            .collect()
    }

    fn assert_close(actual: Complex<f32>, expected: Complex<f32>) {
        assert!(
            (actual - expected).norm() < EPS,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    fn test_signal(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let i = i as f32;
                (0.7 * i).sin() + 0.3 * (2.1 * i).cos() + 0.01 * i
            })
            .collect()
    }

    #[test]
    fn parameter_validation() {
        let defaults = AnalysisParameters::default();
        assert_eq!(defaults.num_samples(), 513);
        assert_eq!(defaults.lo_cutoff(), 200.0);
        assert_eq!(defaults.hi_cutoff(), 10000.0);

        assert!(AnalysisParameters::new(513, 300.0, 200.0).is_err());
        assert!(AnalysisParameters::new(513, 200.0, 200.0).is_err());
        assert!(AnalysisParameters::new(0, 200.0, 10000.0).is_err());
        assert!(AnalysisParameters::new(MAX_NUM_SAMPLES + 1, 200.0, 10000.0).is_err());
        assert!(AnalysisParameters::new(1024, 20.0, 20000.0).is_ok());
    }

    #[test]
    fn default_indices_for_cd_audio() {
        let fmt = AudioFormat::new(44100, SampleFormat::S16, 2);
        let cache = Arc::new(RingCache::new(fmt, Duration::from_secs(1)).expect("Failed to create cache"));
        let analyzer = FrequencyAnalyzer::new(&AnalysisParameters::default(), cache)
            .expect("Failed to create analyzer");

        assert_eq!(analyzer.idx_lo(), 2);
        assert_eq!(analyzer.idx_hi(), 117);
        assert!(analyzer.idx_lo() <= analyzer.idx_mids());
        assert!(analyzer.idx_mids() <= analyzer.idx_trebs());
        assert!(analyzer.idx_trebs() <= analyzer.idx_hi());
        assert_eq!(analyzer.payload_len(), 17 + 8 * (513 + 3 * 115 + 3));
    }

    #[test_log::test]
    fn hi_cutoff_is_clamped() {
        let fmt = AudioFormat::new(8000, SampleFormat::S16, 1);
        let cache = Arc::new(RingCache::new(fmt, Duration::from_secs(1)).expect("Failed to create cache"));
        let params = AnalysisParameters::new(64, 200.0, 20000.0).expect("Invalid parameters");
        let analyzer = FrequencyAnalyzer::new(&params, cache).expect("Failed to create analyzer");

        assert_eq!(analyzer.freq_hi(), 8000.0);
        assert_eq!(analyzer.idx_hi(), 64);
    }

    #[test]
    fn rejects_unusable_configurations() {
        // lo_cutoff above the clamped maximum
        let fmt = AudioFormat::new(8000, SampleFormat::S16, 1);
        let cache = Arc::new(RingCache::new(fmt, Duration::from_secs(1)).expect("Failed to create cache"));
        let params = AnalysisParameters::new(64, 9000.0, 20000.0).expect("Invalid parameters");
        assert!(FrequencyAnalyzer::new(&params, Arc::clone(&cache)).is_err());

        // Payload too large for a frame
        let fmt = AudioFormat::new(44100, SampleFormat::Float, 8);
        let cache = Arc::new(RingCache::new(fmt, Duration::from_secs(1)).expect("Failed to create cache"));
        let params = AnalysisParameters::new(8192, 20.0, 20000.0).expect("Invalid parameters");
        assert!(matches!(
            FrequencyAnalyzer::new(&params, cache),
            Err(Error::Analysis(_))
        ));

        // Sample rate doesn't fit the frame header
        let fmt = AudioFormat::new(96000, SampleFormat::S16, 2);
        let cache = Arc::new(RingCache::new(fmt, Duration::from_secs(1)).expect("Failed to create cache"));
        assert!(FrequencyAnalyzer::new(&AnalysisParameters::default(), cache).is_err());
    }

    #[test]
    fn update_fails_without_history() {
        let cache = float_cache(1, 1, &[0.5, 0.5], Duration::from_secs(8));
        let params = AnalysisParameters::new(4, 0.25, 0.5).expect("Invalid parameters");
        let mut analyzer =
            FrequencyAnalyzer::new(&params, Arc::clone(&cache)).expect("Failed to create analyzer");

        assert!(!analyzer.update(newest(&cache)));
        let mut bmt = [1.0f32; 3];
        assert!(analyzer.get_bass_mids_trebs(&mut bmt));
        assert_eq!(bmt, [0.0, 0.0, 0.0]);
    }

    #[test_log::test]
    fn trivial_dft() {
        // Interleaved: ch0 = [0.5, 0.5, 0.5, -1.5, 0.5], ch1 = [0.25; 5]
        let frames = [
            0.5, 0.25, 0.5, 0.25, 0.5, 0.25, -1.5, 0.25, 0.5, 0.25,
        ];
        let cache = float_cache(1, 2, &frames, Duration::from_secs(5));
        let params = AnalysisParameters::new(5, 0.25, 0.75).expect("Invalid parameters");
        let mut analyzer =
            FrequencyAnalyzer::new(&params, Arc::clone(&cache)).expect("Failed to create analyzer");

        assert_eq!(analyzer.idx_lo(), 1);
        assert_eq!(analyzer.idx_hi(), 4);
        assert_eq!(analyzer.num_freq(), 3);
        assert_eq!(analyzer.num_channels(), 2);

        assert!(analyzer.update(newest(&cache)));

        let mut coeffs = vec![Complex::new(0.0, 0.0); 6];
        assert!(!analyzer.get_coeffs(&mut coeffs[..5]));
        assert!(analyzer.get_coeffs(&mut coeffs));

        assert_close(coeffs[0], Complex::new(0.5, 0.0));
        assert_close(coeffs[1], Complex::new(1.618034, -1.1755705));
        assert_close(coeffs[2], Complex::new(-0.618034, 1.9021131));
        assert_close(coeffs[3], Complex::new(1.25, 0.0));
        assert_close(coeffs[4], Complex::new(0.0, 0.0));
        assert_close(coeffs[5], Complex::new(0.0, 0.0));

        let mut bmt = [0.0f32; 6];
        assert!(!analyzer.get_bass_mids_trebs(&mut bmt[..5]));
        assert!(analyzer.get_bass_mids_trebs(&mut bmt));
        let expected = [0.0, 2.0, 4.0, 0.0, 0.0, 0.0];
        for (a, e) in bmt.iter().zip(expected) {
            assert!((a - e).abs() < EPS, "expected {:?}, got {:?}", expected, bmt);
        }

        let mut waveforms = Vec::new();
        analyzer.serialize_waveforms(&mut waveforms);
        assert_eq!(
            decode_floats(&waveforms),
            vec![0.5, 0.5, 0.5, -1.5, 0.5, 0.25, 0.25, 0.25, 0.25, 0.25]
        );

        // Y1, Y2, then Y3 = conj(Y2) synthesized past the stored half
        let mut serialized = Vec::new();
        analyzer.serialize_coefficients(&mut serialized);
        let floats = decode_floats(&serialized);
        assert_eq!(floats.len(), 2 * 3 * 2);
        let ch0: Vec<Complex<f32>> = floats[..6]
            .chunks_exact(2)
            .map(|p| Complex::new(p[0], p[1]))
            .collect();
        assert_close(ch0[0], Complex::new(1.618034, -1.1755705));
        assert_close(ch0[1], Complex::new(-0.618034, 1.9021131));
        assert_close(ch0[2], Complex::new(-0.618034, -1.9021131));
        assert!(floats[6..].iter().all(|x| x.abs() < EPS));

        let mut spectra = Vec::new();
        analyzer.serialize_power_spectra(&mut spectra);
        let spectra = decode_floats(&spectra);
        assert_eq!(spectra.len(), 6);
        for (i, s) in spectra.iter().enumerate() {
            let expected = if i < 3 { 2.0 } else { 0.0 };
            assert!((s - expected).abs() < EPS, "spectrum {:?}", spectra);
        }

        let mut payload = Vec::new();
        analyzer.serialize_frame_payload(&mut payload);
        assert_eq!(payload.len(), 153);
        assert_eq!(payload.len(), analyzer.payload_len());
        assert_eq!(&payload[..5], &[0x00, 0x05, 0x02, 0x00, 0x01]);
        // num_freq, freq_lo, freq_hi, idx_lo follow the waveforms
        let off = 5 + 4 * 10;
        assert_eq!(&payload[off..off + 2], &[0x00, 0x03]);
        assert_eq!(&payload[off + 2..off + 6], &0.25f32.to_be_bytes());
        assert_eq!(&payload[off + 6..off + 10], &0.75f32.to_be_bytes());
        assert_eq!(&payload[off + 10..off + 12], &[0x00, 0x01]);
    }

    /// Serialize coefficients for a mono window and compare against a
    /// direct DFT over every requested bin.
    fn check_against_dft(n: usize, lo: f32, hi: f32, expected_lo: usize, expected_hi: usize) {
        let signal = test_signal(n);
        let cache = float_cache(n as u32, 1, &signal, Duration::from_secs(1));
        let params = AnalysisParameters::new(n, lo, hi).expect("Invalid parameters");
        let mut analyzer =
            FrequencyAnalyzer::new(&params, Arc::clone(&cache)).expect("Failed to create analyzer");
        assert_eq!(analyzer.idx_lo(), expected_lo);
        assert_eq!(analyzer.idx_hi(), expected_hi);
        assert!(analyzer.update(newest(&cache)));

        let reference = naive_dft(&signal);

        let mut serialized = Vec::new();
        analyzer.serialize_coefficients(&mut serialized);
        let coeffs: Vec<Complex<f32>> = decode_floats(&serialized)
            .chunks_exact(2)
            .map(|p| Complex::new(p[0], p[1]))
            .collect();
        assert_eq!(coeffs.len(), expected_hi - expected_lo);
        for (k, c) in (expected_lo..expected_hi).zip(&coeffs) {
            assert_close(*c, reference[k]);
        }

        let mut spectra = Vec::new();
        analyzer.serialize_power_spectra(&mut spectra);
        for (k, s) in (expected_lo..expected_hi).zip(decode_floats(&spectra)) {
            assert!((s - reference[k].norm()).abs() < EPS);
        }

        let mut bmt = [0.0f32; 3];
        assert!(analyzer.get_bass_mids_trebs(&mut bmt));
        let total: f32 = (expected_lo..expected_hi).map(|k| reference[k].norm()).sum();
        assert!((bmt.iter().sum::<f32>() - total).abs() < 1e-2);
    }

    #[test]
    fn mirrored_coefficients_even_window() {
        check_against_dft(16, 2.0, 13.0, 2, 13);
    }

    #[test]
    fn mirrored_coefficients_odd_window() {
        check_against_dft(17, 2.0, 13.0, 2, 13);
    }

    #[test]
    fn range_entirely_past_stored_half_even() {
        check_against_dft(16, 12.0, 15.0, 12, 15);
    }

    #[test]
    fn range_entirely_past_stored_half_odd() {
        check_against_dft(17, 12.0, 16.0, 12, 16);
    }

    #[test]
    fn range_within_stored_half() {
        check_against_dft(32, 3.0, 10.0, 3, 10);
    }

    #[test]
    fn index_torture_three_channels() {
        // f(x) = sin(x) + cos(2x)/2, g(x) = sin(2x) + cos(4x)/4,
        // h(x) = sin(x/2) + 2cos(2x), sampled at x = u*pi/4 for u in 0..17
        let waves: [fn(f64) -> f64; 3] = [
            |x| x.sin() + 0.5 * (2.0 * x).cos(),
            |x| (2.0 * x).sin() + 0.25 * (4.0 * x).cos(),
            |x| (x / 2.0).sin() + 2.0 * (2.0 * x).cos(),
        ];
        let channels: Vec<Vec<f32>> = waves
            .iter()
            .map(|f| {
                (0..17)
                    .map(|u| f(u as f64 * std::f64::consts::FRAC_PI_4) as f32)
                    .collect()
            })
            .collect();
        let interleaved: Vec<f32> = (0..17)
            .flat_map(|u| channels.iter().map(move |ch| ch[u]))
            .collect();
        let references: Vec<Vec<Complex<f32>>> = channels.iter().map(|ch| naive_dft(ch)).collect();

        let cases = [
            (0.0, 0.5, 0, 9),
            (0.0, 1.0, 0, 17),
            (0.06, 0.5, 1, 9),
            (0.12, 0.5, 2, 9),
            (0.0, 0.47, 0, 8),
            (0.0, 0.4, 0, 7),
            (0.06, 0.47, 1, 8),
            (0.12, 0.4, 2, 7),
            (0.0, 0.53, 0, 10),
            (0.0, 0.59, 0, 11),
            (0.42, 0.59, 7, 11),
            (0.48, 0.59, 8, 11),
            (0.48, 0.65, 8, 12),
            (0.53, 1.0, 9, 17),
            (0.59, 0.89, 10, 16),
            (0.65, 0.89, 11, 16),
        ];

        for (lo, hi, idx_lo, idx_hi) in cases {
            let cache = float_cache(1, 3, &interleaved, Duration::from_secs(18));
            let (t0, t1) = cache.range().expect("Cache should hold data");
            assert_eq!(t1 - t0, Duration::from_secs(17));

            let params = AnalysisParameters::new(17, lo, hi).expect("Invalid parameters");
            let mut analyzer = FrequencyAnalyzer::new(&params, Arc::clone(&cache))
                .expect("Failed to create analyzer");
            assert_eq!(analyzer.num_channels(), 3);
            assert_eq!(analyzer.num_samples(), 17);
            assert_eq!(
                (analyzer.idx_lo(), analyzer.idx_hi()),
                (idx_lo, idx_hi),
                "cutoffs ({}, {})",
                lo,
                hi
            );
            assert!(analyzer.update(t1));

            let mut serialized = Vec::new();
            analyzer.serialize_coefficients(&mut serialized);
            assert_eq!(serialized.len(), 3 * 8 * (idx_hi - idx_lo));

            let coeffs: Vec<Complex<f32>> = decode_floats(&serialized)
                .chunks_exact(2)
                .map(|p| Complex::new(p[0], p[1]))
                .collect();
            for (chan, reference) in references.iter().enumerate() {
                let chunk = &coeffs[chan * (idx_hi - idx_lo)..(chan + 1) * (idx_hi - idx_lo)];
                for (k, c) in (idx_lo..idx_hi).zip(chunk) {
                    assert!(
                        (*c - reference[k]).norm() < EPS * 10.0,
                        "cutoffs ({}, {}), channel {}, bin {}: expected {}, got {}",
                        lo,
                        hi,
                        chan,
                        k,
                        reference[k],
                        c
                    );
                }
            }
        }
    }

    #[test]
    fn integer_formats_are_normalized() {
        let fmt = AudioFormat::new(4, SampleFormat::S16, 2);
        let cache = RingCache::new(fmt, Duration::from_secs(1)).expect("Failed to create cache");
        let samples: [i16; 8] = [16384, -16384, 0, 8192, -32768, 0, 16384, 0];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        cache.add(&bytes);
        let cache = Arc::new(cache);

        let params = AnalysisParameters::new(4, 1.0, 2.0).expect("Invalid parameters");
        let mut analyzer =
            FrequencyAnalyzer::new(&params, Arc::clone(&cache)).expect("Failed to create analyzer");
        assert!(analyzer.update(newest(&cache)));

        let mut waveforms = Vec::new();
        analyzer.serialize_waveforms(&mut waveforms);
        assert_eq!(
            decode_floats(&waveforms),
            vec![0.5, 0.0, -1.0, 0.5, -0.5, 0.25, 0.0, 0.0]
        );
    }
}
