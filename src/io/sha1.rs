use hmac::{Hmac, Mac};

type HmacSha1 = Hmac<sha1::Sha1>;

/// HMAC-SHA1 keyed with the STUN short-term credential.
#[derive(Clone)]
pub struct Sha1(HmacSha1);

impl Sha1 {
    pub fn hmac(mut self, payloads: &[&[u8]]) -> [u8; 20] {
        for payload in payloads {
            self.0.update(payload);
        }

        let comp = self.0.finalize().into_bytes();
        comp.into()
    }
}

impl From<&[u8]> for Sha1 {
    fn from(value: &[u8]) -> Self {
        // HMAC takes keys of any length.
        Sha1(HmacSha1::new_from_slice(value).expect("hmac key of any size"))
    }
}
