//! Streaming block cipher with an asymmetrically wrapped session key.
//!
//! Every block gets a fresh 256-bit session key and nonce prefix. Both are
//! sealed to the account's X25519 public key (ephemeral DH, HKDF-SHA256,
//! AES-256-GCM) and written as a length-prefixed header in front of the
//! ciphertext. The body is cut into 64 KiB segments, each sealed with
//! AES-256-GCM under a nonce built from the prefix, a big-endian segment
//! counter and a last-segment flag, so a truncated or reordered stream
//! fails authentication.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CipherError;

/// Plaintext bytes per sealed segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;
/// AEAD tag appended to every segment.
pub const TAG_SIZE: usize = 16;
/// Session nonce prefix length; the remaining 5 nonce bytes are counter and flag.
const NONCE_PREFIX_LEN: usize = 7;
const WRAP_NONCE_LEN: usize = 12;
const SESSION_LEN: usize = 32 + NONCE_PREFIX_LEN;
/// Header body: ephemeral public key, wrap nonce, sealed session.
const HEADER_BODY_LEN: usize = 32 + WRAP_NONCE_LEN + SESSION_LEN + TAG_SIZE;
/// Full header including the u16 length prefix.
pub const HEADER_LEN: usize = 2 + HEADER_BODY_LEN;

const KEY_WRAP_INFO: &[u8] = b"vaultfs/block-key";

/// X25519 key pair identifying an account. Blocks are sealed to its public half.
#[derive(Clone)]
pub struct AccountKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountKeys(public={})", hex::encode(self.public.as_bytes()))
    }
}

impl AccountKeys {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuilds a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret bytes for persisting to a key file.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// The public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Starts a new block sealed to this account.
    pub fn encryptor(&self) -> (Vec<u8>, Encryptor) {
        Encryptor::new(&self.public)
    }

    /// Starts decrypting a block sealed to this account.
    pub fn decryptor(&self) -> Decryptor {
        Decryptor::new(self)
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey {
    key: [u8; 32],
    prefix: [u8; NONCE_PREFIX_LEN],
}

impl SessionKey {
    fn random() -> Self {
        let mut session = Self {
            key: [0u8; 32],
            prefix: [0u8; NONCE_PREFIX_LEN],
        };
        OsRng.fill_bytes(&mut session.key);
        OsRng.fill_bytes(&mut session.prefix);
        session
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

fn derive_kek(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_WRAP_INFO, &mut okm[..])
        .expect("32-byte HKDF output is always valid");
    okm
}

fn seal_session(session: &SessionKey, recipient: &PublicKey) -> Vec<u8> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let kek = derive_kek(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());

    let mut wrap_nonce = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut wrap_nonce);

    let mut plain = Zeroizing::new([0u8; SESSION_LEN]);
    plain[..32].copy_from_slice(&session.key);
    plain[32..].copy_from_slice(&session.prefix);

    let wrapper = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&kek[..]));
    let sealed = wrapper
        .encrypt(aes_gcm::Nonce::from_slice(&wrap_nonce), &plain[..])
        .expect("AES-GCM encryption of a fixed-size buffer cannot fail");

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&(HEADER_BODY_LEN as u16).to_le_bytes());
    header.extend_from_slice(ephemeral_public.as_bytes());
    header.extend_from_slice(&wrap_nonce);
    header.extend_from_slice(&sealed);
    header
}

fn open_session(body: &[u8], keys: &AccountKeys) -> Result<SessionKey, CipherError> {
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&body[..32]);
    let wrap_nonce = &body[32..32 + WRAP_NONCE_LEN];
    let sealed = &body[32 + WRAP_NONCE_LEN..];

    let ephemeral_public = PublicKey::from(ephemeral);
    let shared = keys.secret.diffie_hellman(&ephemeral_public);
    let kek = derive_kek(shared.as_bytes(), &ephemeral, keys.public.as_bytes());
    let wrapper = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&kek[..]));
    let plain = Zeroizing::new(
        wrapper
            .decrypt(aes_gcm::Nonce::from_slice(wrap_nonce), sealed)
            .map_err(|_| CipherError::WrongKey)?,
    );
    if plain.len() != SESSION_LEN {
        return Err(CipherError::WrongKey);
    }
    let mut session = SessionKey {
        key: [0u8; 32],
        prefix: [0u8; NONCE_PREFIX_LEN],
    };
    session.key.copy_from_slice(&plain[..32]);
    session.prefix.copy_from_slice(&plain[32..]);
    Ok(session)
}

fn segment_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = last as u8;
    nonce
}

/// Exact ciphertext length (header included) produced for `plain_len` bytes.
pub fn expected_ciphertext_len(plain_len: u64) -> u64 {
    let seg = SEGMENT_SIZE as u64;
    let full = if plain_len == 0 { 0 } else { (plain_len - 1) / seg };
    let last = plain_len - full * seg;
    HEADER_LEN as u64 + full * (seg + TAG_SIZE as u64) + last + TAG_SIZE as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
    Poisoned,
}

/// Encrypting half of a block stream.
pub struct Encryptor {
    session: SessionKey,
    cipher: Aes256Gcm,
    counter: u32,
    buffer: Vec<u8>,
    pending_header: Option<Vec<u8>>,
    state: StreamState,
}

impl Encryptor {
    /// Creates a stream sealed to `recipient`.
    ///
    /// Returns the header bytes as well; the first `transform` output also
    /// starts with them, so callers writing the output verbatim need not
    /// handle the header separately.
    pub fn new(recipient: &PublicKey) -> (Vec<u8>, Self) {
        let session = SessionKey::random();
        let header = seal_session(&session, recipient);
        let cipher = session.cipher();
        let enc = Self {
            session,
            cipher,
            counter: 0,
            buffer: Vec::new(),
            pending_header: Some(header.clone()),
            state: StreamState::Open,
        };
        (header, enc)
    }

    /// Feeds plaintext and returns whatever ciphertext is ready.
    ///
    /// Full segments are emitted as soon as a byte beyond them is buffered.
    /// `is_final` seals the remainder (possibly empty) as the last segment.
    pub fn transform(&mut self, chunk: &[u8], is_final: bool) -> Result<Vec<u8>, CipherError> {
        match self.state {
            StreamState::Finished => return Err(CipherError::Finalized),
            StreamState::Poisoned => return Err(CipherError::Poisoned),
            StreamState::Open => {}
        }

        self.buffer.extend_from_slice(chunk);
        let mut out = self.pending_header.take().unwrap_or_default();

        let mut consumed = 0;
        while self.buffer.len() - consumed > SEGMENT_SIZE {
            let end = consumed + SEGMENT_SIZE;
            let sealed = self.seal(consumed, end, false)?;
            out.extend_from_slice(&sealed);
            consumed = end;
        }
        if is_final {
            let end = self.buffer.len();
            let sealed = self.seal(consumed, end, true)?;
            out.extend_from_slice(&sealed);
            consumed = end;
            self.state = StreamState::Finished;
        }
        self.buffer.drain(..consumed);
        Ok(out)
    }

    fn seal(&mut self, start: usize, end: usize, last: bool) -> Result<Vec<u8>, CipherError> {
        let nonce = segment_nonce(&self.session.prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), &self.buffer[start..end]);
        match sealed {
            Ok(sealed) => {
                self.counter = self.counter.wrapping_add(1);
                Ok(sealed)
            }
            Err(_) => {
                self.state = StreamState::Poisoned;
                Err(CipherError::Poisoned)
            }
        }
    }

    /// True once the final segment has been emitted.
    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }
}

enum Phase {
    Header,
    Body {
        session: SessionKey,
        cipher: Aes256Gcm,
        counter: u32,
    },
}

/// Decrypting half of a block stream.
pub struct Decryptor {
    keys: AccountKeys,
    phase: Phase,
    buffer: Vec<u8>,
    state: StreamState,
}

impl Decryptor {
    /// Creates a decryptor that reads the header from the front of the stream.
    pub fn new(keys: &AccountKeys) -> Self {
        Self {
            keys: keys.clone(),
            phase: Phase::Header,
            buffer: Vec::new(),
            state: StreamState::Open,
        }
    }

    /// Creates a decryptor from a header received separately from the body.
    pub fn with_header(keys: &AccountKeys, header: &[u8]) -> Result<Self, CipherError> {
        let mut dec = Self::new(keys);
        let out = dec.transform(header, false)?;
        debug_assert!(out.is_empty());
        if matches!(dec.phase, Phase::Header) {
            dec.state = StreamState::Poisoned;
            return Err(CipherError::MalformedHeader {
                declared: header.len(),
                expected: HEADER_LEN,
            });
        }
        Ok(dec)
    }

    /// Feeds ciphertext and returns whatever plaintext is authenticated.
    pub fn transform(&mut self, chunk: &[u8], is_final: bool) -> Result<Vec<u8>, CipherError> {
        match self.state {
            StreamState::Finished => return Err(CipherError::Finalized),
            StreamState::Poisoned => return Err(CipherError::Poisoned),
            StreamState::Open => {}
        }
        self.buffer.extend_from_slice(chunk);
        let result = self.process(is_final);
        match &result {
            Err(_) => {
                self.state = StreamState::Poisoned;
                self.buffer.clear();
            }
            Ok(_) if is_final => self.state = StreamState::Finished,
            Ok(_) => {}
        }
        result
    }

    fn process(&mut self, is_final: bool) -> Result<Vec<u8>, CipherError> {
        let mut consumed = 0;
        if matches!(self.phase, Phase::Header) {
            if self.buffer.len() < 2 {
                return if is_final {
                    Err(CipherError::Truncated {
                        reason: "missing header length".into(),
                    })
                } else {
                    Ok(Vec::new())
                };
            }
            let declared = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if declared != HEADER_BODY_LEN {
                return Err(CipherError::MalformedHeader {
                    declared,
                    expected: HEADER_BODY_LEN,
                });
            }
            if self.buffer.len() < HEADER_LEN {
                return if is_final {
                    Err(CipherError::Truncated {
                        reason: "incomplete header".into(),
                    })
                } else {
                    Ok(Vec::new())
                };
            }
            let session = open_session(&self.buffer[2..HEADER_LEN], &self.keys)?;
            let cipher = session.cipher();
            self.phase = Phase::Body {
                session,
                cipher,
                counter: 0,
            };
            consumed = HEADER_LEN;
        }

        let Phase::Body {
            session,
            cipher,
            counter,
        } = &mut self.phase
        else {
            unreachable!("header phase handled above");
        };

        let sealed_seg = SEGMENT_SIZE + TAG_SIZE;
        let mut out = Vec::new();
        while self.buffer.len() - consumed > sealed_seg {
            let end = consumed + sealed_seg;
            let nonce = segment_nonce(&session.prefix, *counter, false);
            let plain = cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), &self.buffer[consumed..end])
                .map_err(|_| CipherError::Tampered { segment: *counter })?;
            out.extend_from_slice(&plain);
            *counter = counter.wrapping_add(1);
            consumed = end;
        }

        if is_final {
            let rest = self.buffer.len() - consumed;
            if rest < TAG_SIZE {
                return Err(CipherError::Truncated {
                    reason: format!("final segment is {} bytes", rest),
                });
            }
            let nonce = segment_nonce(&session.prefix, *counter, true);
            let plain = cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), &self.buffer[consumed..])
                .map_err(|_| CipherError::Truncated {
                    reason: format!("segment {} is not a valid final segment", counter),
                })?;
            out.extend_from_slice(&plain);
            consumed = self.buffer.len();
        }

        self.buffer.drain(..consumed);
        Ok(out)
    }
}

/// Encrypts a complete buffer for `recipient`.
pub fn seal_all(recipient: &PublicKey, plaintext: &[u8]) -> Vec<u8> {
    let (_, mut enc) = Encryptor::new(recipient);
    enc.transform(plaintext, true)
        .expect("fresh encryptor accepts its first and final input")
}

/// Decrypts a complete buffer produced by [`seal_all`] or an [`Encryptor`].
pub fn open_all(keys: &AccountKeys, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    keys.decryptor().transform(ciphertext, true)
}
