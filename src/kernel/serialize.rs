/*!
A small field-visitor for persisting component state.

Stateful types implement `Persist` and list their fields by name against an
`Archive`; the archive decides the representation. Two archives are
provided: a line-oriented text form (for inspection and snapshot diffing)
and a compact binary form. Reading uses the same `serialize` listing, so a
type cannot drift between its save and load paths.
*/

use std::collections::VecDeque;

/// Visitor over named fields.
pub trait Archive {
    fn field_u64(&mut self, name: &str, value: &mut u64);
    fn field_u32(&mut self, name: &str, value: &mut u32);
    fn field_bool(&mut self, name: &str, value: &mut bool);
    fn field_bytes(&mut self, name: &str, value: &mut [u8]);
}

/// A type whose state can be driven through an archive.
pub trait Persist {
    fn serialize(&mut self, ar: &mut dyn Archive);
}

/// Writes `name value` lines.
#[derive(Default)]
pub struct TextWriter {
    pub out: String,
}

impl Archive for TextWriter {
    fn field_u64(&mut self, name: &str, value: &mut u64) {
        self.out.push_str(&format!("{name} {value}\n"));
    }
    fn field_u32(&mut self, name: &str, value: &mut u32) {
        self.out.push_str(&format!("{name} {value}\n"));
    }
    fn field_bool(&mut self, name: &str, value: &mut bool) {
        self.out.push_str(&format!("{name} {}\n", u8::from(*value)));
    }
    fn field_bytes(&mut self, name: &str, value: &mut [u8]) {
        self.out.push_str(name);
        for b in value.iter() {
            self.out.push_str(&format!(" {b:02x}"));
        }
        self.out.push('\n');
    }
}

/// Little-endian binary writer; names are not stored, the field listing
/// itself is the schema.
#[derive(Default)]
pub struct BinWriter {
    pub out: Vec<u8>,
}

impl Archive for BinWriter {
    fn field_u64(&mut self, _name: &str, value: &mut u64) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }
    fn field_u32(&mut self, _name: &str, value: &mut u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }
    fn field_bool(&mut self, _name: &str, value: &mut bool) {
        self.out.push(u8::from(*value));
    }
    fn field_bytes(&mut self, _name: &str, value: &mut [u8]) {
        self.out.extend_from_slice(value);
    }
}

/// Binary reader matching `BinWriter`.
pub struct BinReader {
    data: VecDeque<u8>,
}

impl BinReader {
    pub fn new(data: Vec<u8>) -> Self {
        BinReader { data: data.into() }
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        assert!(self.data.len() >= n, "archive underrun");
        self.data.drain(..n).collect()
    }
}

impl Archive for BinReader {
    fn field_u64(&mut self, _name: &str, value: &mut u64) {
        let bytes = self.take(8);
        *value = u64::from_le_bytes(bytes.try_into().expect("eight bytes"));
    }
    fn field_u32(&mut self, _name: &str, value: &mut u32) {
        let bytes = self.take(4);
        *value = u32::from_le_bytes(bytes.try_into().expect("four bytes"));
    }
    fn field_bool(&mut self, _name: &str, value: &mut bool) {
        *value = self.take(1)[0] != 0;
    }
    fn field_bytes(&mut self, _name: &str, value: &mut [u8]) {
        let bytes = self.take(value.len());
        value.copy_from_slice(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        cycle: u64,
        tokens: u32,
        dirty: bool,
        data: [u8; 4],
    }

    impl Persist for Probe {
        fn serialize(&mut self, ar: &mut dyn Archive) {
            ar.field_u64("cycle", &mut self.cycle);
            ar.field_u32("tokens", &mut self.tokens);
            ar.field_bool("dirty", &mut self.dirty);
            ar.field_bytes("data", &mut self.data);
        }
    }

    #[test]
    fn binary_round_trip() {
        let mut probe = Probe {
            cycle: 99,
            tokens: 3,
            dirty: true,
            data: [1, 2, 3, 4],
        };
        let mut writer = BinWriter::default();
        probe.serialize(&mut writer);

        let mut restored = Probe {
            cycle: 0,
            tokens: 0,
            dirty: false,
            data: [0; 4],
        };
        let mut reader = BinReader::new(writer.out);
        restored.serialize(&mut reader);
        assert_eq!(restored.cycle, 99);
        assert_eq!(restored.tokens, 3);
        assert!(restored.dirty);
        assert_eq!(restored.data, [1, 2, 3, 4]);
    }

    #[test]
    fn text_form_lists_fields_by_name() {
        let mut probe = Probe {
            cycle: 7,
            tokens: 1,
            dirty: false,
            data: [0xaa, 0xbb, 0, 0],
        };
        let mut writer = TextWriter::default();
        probe.serialize(&mut writer);
        assert!(writer.out.contains("cycle 7"));
        assert!(writer.out.contains("tokens 1"));
        assert!(writer.out.contains("aa bb"));
    }
}
