pub mod state {
    use std::collections::BTreeMap;

    use thiserror::Error;

    /// Current on-wire revision of every snapshot produced by this workspace.
    pub const SNAPSHOT_VERSION: u32 = 1;

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum SnapshotError {
        #[error("snapshot version {found} is not supported (expected {expected})")]
        UnsupportedVersion { found: u32, expected: u32 },
        #[error("missing snapshot field `{0}`")]
        MissingField(String),
        #[error("snapshot field `{key}` has length {found}, expected {expected}")]
        FieldSize {
            key: String,
            found: usize,
            expected: usize,
        },
        #[error("snapshot field `{key}` holds invalid value {value}")]
        InvalidValue { key: String, value: u64 },
    }

    /// A keyed bag of raw little-endian fields.
    ///
    /// Keys are scoped by the device that wrote them (`"ide.ch0.status"`,
    /// `"apic2.irr"`), so one bag can hold a whole device complex.
    #[derive(Debug, Clone, Default)]
    pub struct IoSnapshot {
        version: u32,
        fields: BTreeMap<String, Vec<u8>>,
    }

    impl IoSnapshot {
        pub fn new() -> Self {
            Self {
                version: SNAPSHOT_VERSION,
                fields: BTreeMap::new(),
            }
        }

        pub fn version(&self) -> u32 {
            self.version
        }

        pub fn check_version(&self) -> Result<(), SnapshotError> {
            if self.version != SNAPSHOT_VERSION {
                return Err(SnapshotError::UnsupportedVersion {
                    found: self.version,
                    expected: SNAPSHOT_VERSION,
                });
            }
            Ok(())
        }

        pub fn put_bytes(&mut self, key: &str, value: &[u8]) {
            self.fields.insert(key.to_owned(), value.to_vec());
        }

        pub fn put_u8(&mut self, key: &str, value: u8) {
            self.put_bytes(key, &[value]);
        }

        pub fn put_u16(&mut self, key: &str, value: u16) {
            self.put_bytes(key, &value.to_le_bytes());
        }

        pub fn put_u32(&mut self, key: &str, value: u32) {
            self.put_bytes(key, &value.to_le_bytes());
        }

        pub fn put_u64(&mut self, key: &str, value: u64) {
            self.put_bytes(key, &value.to_le_bytes());
        }

        pub fn get_bytes(&self, key: &str) -> Result<&[u8], SnapshotError> {
            self.fields
                .get(key)
                .map(Vec::as_slice)
                .ok_or_else(|| SnapshotError::MissingField(key.to_owned()))
        }

        pub fn get_array<const N: usize>(&self, key: &str) -> Result<[u8; N], SnapshotError> {
            let raw = self.get_bytes(key)?;
            raw.try_into().map_err(|_| SnapshotError::FieldSize {
                key: key.to_owned(),
                found: raw.len(),
                expected: N,
            })
        }

        pub fn get_u8(&self, key: &str) -> Result<u8, SnapshotError> {
            Ok(self.get_array::<1>(key)?[0])
        }

        pub fn get_u16(&self, key: &str) -> Result<u16, SnapshotError> {
            Ok(u16::from_le_bytes(self.get_array(key)?))
        }

        pub fn get_u32(&self, key: &str) -> Result<u32, SnapshotError> {
            Ok(u32::from_le_bytes(self.get_array(key)?))
        }

        pub fn get_u64(&self, key: &str) -> Result<u64, SnapshotError> {
            Ok(u64::from_le_bytes(self.get_array(key)?))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips_typed_fields() {
            let mut snap = IoSnapshot::new();
            snap.put_u8("a", 0x12);
            snap.put_u16("b", 0x3456);
            snap.put_u32("c", 0x789a_bcde);
            snap.put_u64("d", 0x0102_0304_0506_0708);
            snap.put_bytes("e", &[1, 2, 3]);

            snap.check_version().unwrap();
            assert_eq!(snap.get_u8("a").unwrap(), 0x12);
            assert_eq!(snap.get_u16("b").unwrap(), 0x3456);
            assert_eq!(snap.get_u32("c").unwrap(), 0x789a_bcde);
            assert_eq!(snap.get_u64("d").unwrap(), 0x0102_0304_0506_0708);
            assert_eq!(snap.get_bytes("e").unwrap(), &[1, 2, 3]);
        }

        #[test]
        fn missing_and_misshapen_fields_error() {
            let mut snap = IoSnapshot::new();
            snap.put_u16("short", 7);

            assert_eq!(
                snap.get_u8("gone"),
                Err(SnapshotError::MissingField("gone".to_owned()))
            );
            assert_eq!(
                snap.get_u32("short"),
                Err(SnapshotError::FieldSize {
                    key: "short".to_owned(),
                    found: 2,
                    expected: 4,
                })
            );
        }
    }
}
