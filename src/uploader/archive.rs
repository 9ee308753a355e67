//! Streaming password-protected archive container.
//!
//! Each source file is wrapped in a single-entry, store-only zip archive
//! encrypted with WinZip AES-256 (AE-2). The writer produces bytes
//! incrementally (opening frame, then ciphertext, then closing frame) so
//! the downstream accumulator consumes the archive without it ever
//! materializing. Zip64 structures are always emitted because source files
//! routinely exceed 4 GB.
//!
//! The AES salt is a constructor parameter. Resume depends on that: replaying
//! a file with the salt recorded in the session must reproduce byte-identical
//! ciphertext, or the chain-hash check at the resume point cannot match.

use super::error::{UploadError, UploadResult};
use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use chrono::{DateTime, Datelike, Timelike, Utc};
use ctr::Ctr128LE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

type Aes256CtrLe = Ctr128LE<Aes256>;
type HmacSha1 = Hmac<Sha1>;

/// AES-256 salt length
pub const SALT_LEN: usize = 16;

const PBKDF2_ROUNDS: u32 = 1000;
/// 32-byte AES key, 32-byte HMAC key, 2-byte password verifier
const DERIVED_KEY_LEN: usize = 66;
/// Truncated HMAC-SHA1 trailer after the ciphertext
const AUTH_CODE_LEN: usize = 10;
const PASSWORD_VERIFIER_LEN: usize = 2;

const LOCAL_HEADER_SIG: u32 = 0x04034b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x08074b50;
const CENTRAL_DIR_SIG: u32 = 0x02014b50;
const ZIP64_EOCD_SIG: u32 = 0x06064b50;
const ZIP64_LOCATOR_SIG: u32 = 0x07064b50;
const EOCD_SIG: u32 = 0x06054b50;

/// AES extra field id ("AE-x")
const AES_EXTRA_ID: u16 = 0x9901;
const ZIP64_EXTRA_ID: u16 = 0x0001;

/// AE-2: authenticated, with the CRC field zeroed, so streaming never
/// needs a second pass over the plaintext
const AES_VENDOR_VERSION: u16 = 2;
const AES_STRENGTH_256: u8 = 0x03;
/// Actual compression method inside the AES wrapper: store
const METHOD_STORE: u16 = 0;
const METHOD_AES: u16 = 99;

/// Version needed to extract: AES encryption (also covers Zip64's 4.5)
const VERSION_AES: u16 = 51;
const VERSION_ZIP64: u16 = 45;

/// Bit 0 encrypted, bit 3 data descriptor, bit 11 UTF-8 names
const FLAGS: u16 = 0x0809;

/// Where the archive salt comes from.
///
/// Fresh uploads draw a random salt; resumed uploads replay the recorded one.
/// A `Fixed` source yields its bytes exactly once. A second request, or a
/// request of the wrong length, means the container code drifted from the
/// one-entry-one-salt contract and the upload must fail rather than silently
/// produce different ciphertext.
pub enum SaltSource {
    Random,
    Fixed { salt: [u8; SALT_LEN], used: bool },
}

impl SaltSource {
    pub fn fixed(salt: [u8; SALT_LEN]) -> Self {
        SaltSource::Fixed { salt, used: false }
    }

    pub fn take(&mut self, len: usize) -> UploadResult<[u8; SALT_LEN]> {
        if len != SALT_LEN {
            return Err(UploadError::resume_failed(format!(
                "salt request of {len} bytes, expected {SALT_LEN}"
            )));
        }
        match self {
            SaltSource::Random => {
                let mut salt = [0u8; SALT_LEN];
                rand::rngs::OsRng.fill_bytes(&mut salt);
                Ok(salt)
            }
            SaltSource::Fixed { used: true, .. } => Err(UploadError::resume_failed(
                "deterministic salt requested more than once",
            )),
            SaltSource::Fixed { salt, used } => {
                *used = true;
                Ok(*salt)
            }
        }
    }
}

/// Streaming writer for a one-entry AES-256 archive.
///
/// Usage: [`begin`](Self::begin) yields the opening frame (local header,
/// salt, password verifier); [`encrypt_in_place`](Self::encrypt_in_place)
/// turns source bytes into ciphertext; [`finish`](Self::finish) yields the
/// closing frame (auth code, data descriptor, central directory, Zip64 end
/// records).
pub struct ArchiveWriter {
    cipher: Aes256CtrLe,
    auth: HmacSha1,
    entry_name: Vec<u8>,
    dos_time: u16,
    dos_date: u16,
    salt: [u8; SALT_LEN],
    verifier: [u8; PASSWORD_VERIFIER_LEN],
    plain_len: u64,
    cipher_len: u64,
}

impl ArchiveWriter {
    /// Derive the key schedule and emit the opening frame.
    ///
    /// The entry name is the source basename with a leading forward slash;
    /// the timestamp fields derive from the job's client-modified time so a
    /// resumed run reproduces identical header bytes.
    pub fn begin(
        basename: &str,
        password: &str,
        salt_source: &mut SaltSource,
        modified: &DateTime<Utc>,
    ) -> UploadResult<(Self, Vec<u8>)> {
        let salt = salt_source.take(SALT_LEN)?;

        let mut derived = [0u8; DERIVED_KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);

        let key: [u8; 32] = derived[..32].try_into().expect("key slice");
        let auth_key = &derived[32..64];
        let verifier: [u8; PASSWORD_VERIFIER_LEN] =
            derived[64..66].try_into().expect("verifier slice");

        // CTR counter starts at 1, little-endian
        let mut iv = [0u8; 16];
        iv[0] = 1;
        let cipher = Aes256CtrLe::new(&key.into(), &iv.into());
        let auth = HmacSha1::new_from_slice(auth_key)
            .map_err(|e| UploadError::Encryption(format!("HMAC key setup failed: {e}")))?;

        let entry_name = format!("/{basename}").into_bytes();
        let (dos_time, dos_date) = dos_datetime(modified);

        let writer = Self {
            cipher,
            auth,
            entry_name,
            dos_time,
            dos_date,
            salt,
            verifier,
            plain_len: 0,
            cipher_len: 0,
        };

        let mut out = Vec::with_capacity(128 + writer.entry_name.len());
        writer.write_local_header(&mut out);
        out.extend_from_slice(&writer.salt);
        out.extend_from_slice(&writer.verifier);
        Ok((writer, out))
    }

    /// Encrypt source bytes in place and fold them into the auth code
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        self.plain_len += data.len() as u64;
        self.cipher.apply_keystream(data);
        self.auth.update(data);
        self.cipher_len += data.len() as u64;
    }

    /// Entry payload length: salt, verifier, ciphertext, auth code
    fn compressed_size(&self) -> u64 {
        (SALT_LEN + PASSWORD_VERIFIER_LEN + AUTH_CODE_LEN) as u64 + self.cipher_len
    }

    /// Emit the closing frame
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.entry_name.len());

        // Truncated HMAC over the ciphertext
        let mac = self.auth.clone().finalize().into_bytes();
        out.extend_from_slice(&mac[..AUTH_CODE_LEN]);

        let compressed = self.compressed_size();
        let uncompressed = self.plain_len;

        // Zip64 data descriptor: CRC is zero under AE-2
        put_u32(&mut out, DATA_DESCRIPTOR_SIG);
        put_u32(&mut out, 0);
        put_u64(&mut out, compressed);
        put_u64(&mut out, uncompressed);

        let central_offset = self.local_entry_len() + compressed + 24;
        let central_start = out.len();
        self.write_central_header(&mut out, compressed, uncompressed);
        let central_size = (out.len() - central_start) as u64;

        // Zip64 end of central directory
        put_u32(&mut out, ZIP64_EOCD_SIG);
        put_u64(&mut out, 44); // record size below this field
        put_u16(&mut out, VERSION_ZIP64);
        put_u16(&mut out, VERSION_ZIP64);
        put_u32(&mut out, 0); // this disk
        put_u32(&mut out, 0); // central directory disk
        put_u64(&mut out, 1); // entries on this disk
        put_u64(&mut out, 1); // entries total
        put_u64(&mut out, central_size);
        put_u64(&mut out, central_offset);

        // Zip64 locator
        put_u32(&mut out, ZIP64_LOCATOR_SIG);
        put_u32(&mut out, 0);
        put_u64(&mut out, central_offset + central_size);
        put_u32(&mut out, 1);

        // Classic end of central directory with Zip64 markers
        put_u32(&mut out, EOCD_SIG);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, 1);
        put_u16(&mut out, 1);
        put_u32(&mut out, 0xFFFF_FFFF);
        put_u32(&mut out, 0xFFFF_FFFF);
        put_u16(&mut out, 0);

        out
    }

    /// Byte length of the local header, name and extras preceding the payload
    fn local_entry_len(&self) -> u64 {
        (30 + self.entry_name.len() + 20 + 11) as u64
    }

    fn write_local_header(&self, out: &mut Vec<u8>) {
        put_u32(out, LOCAL_HEADER_SIG);
        put_u16(out, VERSION_AES);
        put_u16(out, FLAGS);
        put_u16(out, METHOD_AES);
        put_u16(out, self.dos_time);
        put_u16(out, self.dos_date);
        put_u32(out, 0); // CRC: zero under AE-2
        put_u32(out, 0xFFFF_FFFF); // sizes live in the Zip64 descriptor
        put_u32(out, 0xFFFF_FFFF);
        put_u16(out, self.entry_name.len() as u16);
        put_u16(out, 20 + 11); // extra field length
        out.extend_from_slice(&self.entry_name);

        // Zip64 extra: placeholder sizes, patched by the data descriptor
        put_u16(out, ZIP64_EXTRA_ID);
        put_u16(out, 16);
        put_u64(out, 0);
        put_u64(out, 0);

        self.write_aes_extra(out);
    }

    fn write_central_header(&self, out: &mut Vec<u8>, compressed: u64, uncompressed: u64) {
        put_u32(out, CENTRAL_DIR_SIG);
        put_u16(out, VERSION_ZIP64); // version made by
        put_u16(out, VERSION_AES);
        put_u16(out, FLAGS);
        put_u16(out, METHOD_AES);
        put_u16(out, self.dos_time);
        put_u16(out, self.dos_date);
        put_u32(out, 0); // CRC: zero under AE-2
        put_u32(out, 0xFFFF_FFFF);
        put_u32(out, 0xFFFF_FFFF);
        put_u16(out, self.entry_name.len() as u16);
        put_u16(out, 28 + 11); // extra field length
        put_u16(out, 0); // comment
        put_u16(out, 0); // disk number
        put_u16(out, 0); // internal attributes
        put_u32(out, 0); // external attributes
        put_u32(out, 0xFFFF_FFFF); // local header offset in Zip64 extra
        out.extend_from_slice(&self.entry_name);

        put_u16(out, ZIP64_EXTRA_ID);
        put_u16(out, 24);
        put_u64(out, uncompressed);
        put_u64(out, compressed);
        put_u64(out, 0); // local header offset

        self.write_aes_extra(out);
    }

    fn write_aes_extra(&self, out: &mut Vec<u8>) {
        put_u16(out, AES_EXTRA_ID);
        put_u16(out, 7);
        put_u16(out, AES_VENDOR_VERSION);
        out.extend_from_slice(b"AE");
        out.push(AES_STRENGTH_256);
        put_u16(out, METHOD_STORE);
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// MS-DOS timestamp pair (2-second resolution, epoch 1980)
fn dos_datetime(ts: &DateTime<Utc>) -> (u16, u16) {
    let year = ts.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    let time =
        ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
    (time, date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn modified() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 20, 30).unwrap()
    }

    fn render(password: &str, salt: [u8; SALT_LEN], data: &[u8]) -> Vec<u8> {
        let mut source = SaltSource::fixed(salt);
        let (mut writer, mut out) =
            ArchiveWriter::begin("file.bin", password, &mut source, &modified()).unwrap();
        let mut body = data.to_vec();
        writer.encrypt_in_place(&mut body);
        out.extend_from_slice(&body);
        out.extend_from_slice(&writer.finish());
        out
    }

    #[test]
    fn fixed_salt_is_one_shot() {
        let mut source = SaltSource::fixed([9u8; 16]);
        assert_eq!(source.take(16).unwrap(), [9u8; 16]);
        let second = source.take(16);
        assert!(matches!(second, Err(UploadError::ResumeFailed(_))));
    }

    #[test]
    fn wrong_length_salt_request_is_rejected() {
        let mut source = SaltSource::fixed([9u8; 16]);
        assert!(matches!(source.take(8), Err(UploadError::ResumeFailed(_))));
        // the failed request must not consume the salt
        assert!(source.take(16).is_ok());
    }

    #[test]
    fn random_salts_differ() {
        let mut source = SaltSource::Random;
        let a = source.take(16).unwrap();
        let b = source.take(16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn same_salt_reproduces_identical_archives() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let a = render("pw", [3u8; 16], data);
        let b = render("pw", [3u8; 16], data);
        assert_eq!(a, b);
    }

    #[test]
    fn different_salts_produce_different_ciphertext() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let a = render("pw", [3u8; 16], data);
        let b = render("pw", [4u8; 16], data);
        assert_ne!(a, b);
    }

    #[test]
    fn opening_frame_layout() {
        let mut source = SaltSource::fixed([5u8; 16]);
        let (writer, out) =
            ArchiveWriter::begin("photo.jpg", "pw", &mut source, &modified()).unwrap();

        // local header signature
        assert_eq!(&out[0..4], &LOCAL_HEADER_SIG.to_le_bytes());
        // method 99 at offset 8
        assert_eq!(&out[8..10], &METHOD_AES.to_le_bytes());
        // flags: encrypted + descriptor + UTF-8
        assert_eq!(&out[6..8], &FLAGS.to_le_bytes());
        // entry name has the leading slash
        let name_len = u16::from_le_bytes([out[26], out[27]]) as usize;
        assert_eq!(&out[30..30 + name_len], b"/photo.jpg");
        // salt is the last-but-verifier trailer of the opening frame
        let tail = &out[out.len() - SALT_LEN - PASSWORD_VERIFIER_LEN..];
        assert_eq!(&tail[..SALT_LEN], &[5u8; 16]);
        assert_eq!(out.len() as u64, writer.local_entry_len() + 18);
    }

    #[test]
    fn archive_length_accounts_for_all_framing() {
        let data = vec![7u8; 1000];
        let out = render("pw", [1u8; 16], &data);

        let name_len = "/file.bin".len() as u64;
        let opening = 30 + name_len + 20 + 11 + 18;
        let trailer_fixed = AUTH_CODE_LEN as u64 + 24; // auth + descriptor
        let central = 46 + name_len + 28 + 11;
        let ends = 56 + 20 + 22;
        assert_eq!(
            out.len() as u64,
            opening + data.len() as u64 + trailer_fixed + central + ends
        );
    }

    #[test]
    fn ciphertext_round_trips_with_derived_key() {
        let data = b"plaintext to recover".to_vec();
        let salt = [8u8; 16];
        let out = render("secret", salt, &data);

        // Re-derive the key schedule and decrypt the payload slice
        let mut derived = [0u8; DERIVED_KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(b"secret", &salt, PBKDF2_ROUNDS, &mut derived);
        let key: [u8; 32] = derived[..32].try_into().unwrap();
        let mut iv = [0u8; 16];
        iv[0] = 1;
        let mut cipher = Aes256CtrLe::new(&key.into(), &iv.into());

        let payload_start = 30 + "/file.bin".len() + 20 + 11 + 18;
        let mut payload = out[payload_start..payload_start + data.len()].to_vec();
        assert_ne!(payload, data);
        cipher.apply_keystream(&mut payload);
        assert_eq!(payload, data);

        // password verifier matches the derived bytes
        let verifier_at = payload_start - PASSWORD_VERIFIER_LEN;
        assert_eq!(&out[verifier_at..payload_start], &derived[64..66]);
    }

    #[test]
    fn auth_code_is_truncated_hmac_of_ciphertext() {
        let data = vec![42u8; 256];
        let salt = [2u8; 16];
        let out = render("pw", salt, &data);

        let mut derived = [0u8; DERIVED_KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha1>(b"pw", &salt, PBKDF2_ROUNDS, &mut derived);

        let payload_start = 30 + "/file.bin".len() + 20 + 11 + 18;
        let ciphertext = &out[payload_start..payload_start + data.len()];

        let mut mac = HmacSha1::new_from_slice(&derived[32..64]).unwrap();
        mac.update(ciphertext);
        let expected = mac.finalize().into_bytes();

        let auth_at = payload_start + data.len();
        assert_eq!(&out[auth_at..auth_at + AUTH_CODE_LEN], &expected[..AUTH_CODE_LEN]);
    }

    #[test]
    fn split_writes_match_one_shot_encryption() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();

        let one_shot = render("pw", [6u8; 16], &data);

        let mut source = SaltSource::fixed([6u8; 16]);
        let (mut writer, mut split) =
            ArchiveWriter::begin("file.bin", "pw", &mut source, &modified()).unwrap();
        for piece in data.chunks(997) {
            let mut buf = piece.to_vec();
            writer.encrypt_in_place(&mut buf);
            split.extend_from_slice(&buf);
        }
        split.extend_from_slice(&writer.finish());

        assert_eq!(one_shot, split);
    }
}
