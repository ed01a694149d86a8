/*!
State sampling and the binary trace stream.

Components contribute named `u64` values into a `SampleSink`; the
`BinarySampler` turns successive snapshots into the binary stream consumed
by the external trace loader: a `TRF` marker, the variable names, then one
frame per sampled cycle.
*/

use std::io::{self, Write};

/// A flat snapshot of named state values.
#[derive(Debug, Default)]
pub struct SampleSink {
    values: Vec<(String, u64)>,
}

impl SampleSink {
    pub fn new() -> Self {
        SampleSink { values: Vec::new() }
    }

    pub fn record(&mut self, name: &str, value: u64) {
        self.values.push((name.to_string(), value));
    }

    pub fn values(&self) -> &[(String, u64)] {
        &self.values
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Writes sampled frames in the external trace format.
///
/// Layout: `TRF` marker byte triple, a `u32` variable count, the
/// newline-separated variable names, then per frame one `u8` valid marker
/// followed by the little-endian `u64` values in declaration order.
pub struct BinarySampler<W: Write> {
    out: W,
    names: Vec<String>,
    frames: u64,
}

impl<W: Write> BinarySampler<W> {
    pub fn new(out: W) -> Self {
        BinarySampler {
            out,
            names: Vec::new(),
            frames: 0,
        }
    }

    /// Write the header from the first snapshot's variable set.
    pub fn begin(&mut self, sink: &SampleSink) -> io::Result<()> {
        self.names = sink.values().iter().map(|(n, _)| n.clone()).collect();
        self.out.write_all(b"TRF")?;
        self.out.write_all(&(self.names.len() as u32).to_le_bytes())?;
        for name in &self.names {
            self.out.write_all(name.as_bytes())?;
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Append one frame. The snapshot must carry the same variables, in the
    /// same order, as the one passed to `begin`.
    pub fn frame(&mut self, sink: &SampleSink) -> io::Result<()> {
        assert_eq!(
            sink.values().len(),
            self.names.len(),
            "sample frame does not match the declared variable set"
        );
        self.out.write_all(&[1u8])?;
        for (_, v) in sink.values() {
            self.out.write_all(&v.to_le_bytes())?;
        }
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_frames() {
        let mut sink = SampleSink::new();
        sink.record("cache0.reads", 3);
        sink.record("cache0.writes", 1);

        let mut sampler = BinarySampler::new(Vec::new());
        sampler.begin(&sink).unwrap();
        sampler.frame(&sink).unwrap();
        sink.clear();
        sink.record("cache0.reads", 4);
        sink.record("cache0.writes", 1);
        sampler.frame(&sink).unwrap();

        assert_eq!(sampler.frames_written(), 2);
        let bytes = sampler.into_inner();
        assert_eq!(&bytes[0..3], b"TRF");
        let count = u32::from_le_bytes(bytes[3..7].try_into().unwrap());
        assert_eq!(count, 2);
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn mismatched_frame_panics() {
        let mut sink = SampleSink::new();
        sink.record("a", 1);
        let mut sampler = BinarySampler::new(Vec::new());
        sampler.begin(&sink).unwrap();
        sink.record("b", 2);
        sampler.frame(&sink).unwrap();
    }
}
