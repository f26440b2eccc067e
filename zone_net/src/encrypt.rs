//! Plug-in encryption hook. §4.4: "Encryption is plug-in: an `IEncrypt`
//! implementation is named at connection acceptance; decryption happens in
//! place on ingress buffers." The core ships no real cipher — only the
//! trait and a null implementation used by tests and unencrypted listen
//! endpoints (e.g. a `Fake` client_type).

/// Implemented by an encryption module registered through the component
/// broker. Operates in place; callers guarantee `buf` carries trailing
/// slack bytes for cipher block padding on `encrypt`.
pub trait Encryptor: Send + Sync {
    /// Decrypts `buf` in place, returning the plaintext length (may be
    /// shorter than `buf.len()` once padding is stripped).
    fn decrypt(&self, buf: &mut [u8]) -> usize;

    /// Encrypts `buf` in place up to `len`, returning the ciphertext length
    /// (may be longer than `len` once padding is added; caller must have
    /// reserved slack).
    fn encrypt(&self, buf: &mut [u8], len: usize) -> usize;

    /// Invoked once when the connection is torn down so the implementation
    /// can release any per-connection cipher state.
    fn void(&self);
}

/// Identity cipher: used for `Fake` players and in tests where no real
/// encryption module is registered.
pub struct NullEncryptor;

impl Encryptor for NullEncryptor {
    fn decrypt(&self, buf: &mut [u8]) -> usize {
        buf.len()
    }

    fn encrypt(&self, _buf: &mut [u8], len: usize) -> usize {
        len
    }

    fn void(&self) {}
}
