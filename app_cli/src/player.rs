//! PCM producer
//!
//! Plays raw PCM (or a generated tone) into a [`VisualizationOutput`] at
//! real-time pace on its own thread, the way an audio output thread would.

use log::{debug, info};
use std::f32::consts::TAU;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use vis_core::{AudioFormat, Error};
use visualization::{OutputObserver, VisualizationOutput};

/// Audio handed to the output per iteration
const CHUNK: Duration = Duration::from_millis(20);

const TONE_AMPLITUDE: f32 = 0.5;

/// Sine generator
pub struct Tone {
    phase: f32,
    step: f32,
}

impl Tone {
    pub fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate as f32,
        }
    }

    /// Fill `buf` with whole frames of the tone, same on every channel
    pub fn fill(&mut self, format: AudioFormat, buf: &mut [u8]) {
        let sample_size = format.format.sample_size();
        for frame in buf.chunks_exact_mut(format.frame_size()) {
            let x = self.phase.sin() * TONE_AMPLITUDE;
            for sample in frame.chunks_exact_mut(sample_size) {
                format.format.write_float(x, sample);
            }
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// Where played audio comes from
pub enum PcmSource {
    /// Raw interleaved PCM in the output format, host byte order
    Reader(Box<dyn Read + Send>),
    Tone(Tone),
}

/// Feeds a [`VisualizationOutput`] until the source runs dry or `stop` is
/// raised.
pub struct Player<O: OutputObserver> {
    output: VisualizationOutput<O>,
    format: AudioFormat,
    stop: Arc<AtomicBool>,
}

impl<O: OutputObserver + 'static> Player<O> {
    pub fn new(
        observer: O,
        format: AudioFormat,
        cache_span: Duration,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            output: VisualizationOutput::new(observer, cache_span),
            format,
            stop,
        }
    }

    /// Open the output, play `source` and close the output again.
    pub fn run(mut self, source: PcmSource) -> Result<(), Error> {
        self.output.open(self.format)?;
        let played = self.pump(source);
        let closed = self.output.close();
        played.and(closed)
    }

    /// Run on a dedicated thread
    pub fn spawn(self, source: PcmSource) -> Result<JoinHandle<Result<(), Error>>, Error> {
        Ok(thread::Builder::new()
            .name("pcm-producer".to_string())
            .spawn(move || self.run(source))?)
    }

    fn pump(&mut self, mut source: PcmSource) -> Result<(), Error> {
        let chunk_size = self
            .format
            .time_to_size(CHUNK)
            .max(self.format.frame_size());
        let mut buf = vec![0u8; chunk_size];
        let start = Instant::now();
        let mut played = 0usize;

        debug!(
            "Playing {} in chunks of {} bytes",
            self.format, chunk_size
        );

        while !self.stop.load(Ordering::Acquire) {
            let n = match &mut source {
                PcmSource::Reader(reader) => read_full(reader, &mut buf)?,
                PcmSource::Tone(tone) => {
                    tone.fill(self.format, &mut buf);
                    buf.len()
                }
            };
            if n == 0 {
                info!("End of PCM input after {:?}", self.format.size_to_time(played));
                break;
            }

            self.output.play(&buf[..n])?;
            played += n;

            let due = start + self.format.size_to_time(played);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }

        Ok(())
    }
}

/// Read until `buf` is full or the reader is exhausted
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Audio(format!("Failed to read PCM input: {}", e))),
        }
    }
    Ok(filled)
}
