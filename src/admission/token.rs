//! Media vendor "006" access tokens.
//!
//! Layout, all integers little-endian and strings u16-length-prefixed:
//!
//! ```text
//! "006" + app_id + base64( sig:str | crc32(channel):u32 | crc32(uid):u32 | msg:str )
//! msg = salt:u32 | ts:u32 | privileges:map<u16, u32>
//! sig = HMAC-SHA256(app_certificate, app_id + channel + uid + msg)
//! ```
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

pub const VERSION: &str = "006";
/// Validity of the token itself; privileges carry their own expiry.
const TOKEN_LIFETIME_SECS: u32 = 24 * 3600;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u16)]
pub enum Privilege {
    JoinChannel = 1,
    PublishAudioStream = 2,
    PublishVideoStream = 3,
    PublishDataStream = 4,
}

pub struct AccessToken {
    app_id: String,
    app_certificate: String,
    channel: String,
    uid: String,
    salt: u32,
    ts: u32,
    privileges: BTreeMap<u16, u32>,
}

impl AccessToken {
    pub fn new(app_id: &str, app_certificate: &str, channel: &str, uid: u32, now: u32) -> Self {
        Self::with_salt(
            app_id,
            app_certificate,
            channel,
            uid,
            rand::random_range(1..=99_999_999),
            now.saturating_add(TOKEN_LIFETIME_SECS),
        )
    }

    pub fn with_salt(
        app_id: &str,
        app_certificate: &str,
        channel: &str,
        uid: u32,
        salt: u32,
        ts: u32,
    ) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_certificate: app_certificate.to_string(),
            channel: channel.to_string(),
            // uid 0 means "any uid" and is signed as the empty string
            uid: if uid == 0 {
                String::new()
            } else {
                uid.to_string()
            },
            salt,
            ts,
            privileges: BTreeMap::new(),
        }
    }

    pub fn add_privilege(&mut self, privilege: Privilege, expire_at: u32) {
        self.privileges.insert(privilege as u16, expire_at);
    }

    fn message(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.privileges.len() * 6);
        buf.extend_from_slice(&self.salt.to_le_bytes());
        buf.extend_from_slice(&self.ts.to_le_bytes());
        buf.extend_from_slice(&(self.privileges.len() as u16).to_le_bytes());
        for (key, value) in &self.privileges {
            buf.extend_from_slice(&key.to_le_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf
    }

    pub fn build(&self) -> Result<String> {
        if self.app_id.is_empty() || self.app_certificate.is_empty() {
            return Err(anyhow!("app id and certificate are required"));
        }
        let message = self.message();

        let mut mac = HmacSha256::new_from_slice(self.app_certificate.as_bytes())
            .map_err(|e| anyhow!("invalid certificate: {}", e))?;
        mac.update(self.app_id.as_bytes());
        mac.update(self.channel.as_bytes());
        mac.update(self.uid.as_bytes());
        mac.update(&message);
        let signature = mac.finalize().into_bytes();

        let mut content = Vec::with_capacity(signature.len() + message.len() + 12);
        pack_bytes(&mut content, &signature)?;
        content.extend_from_slice(&crc32fast::hash(self.channel.as_bytes()).to_le_bytes());
        content.extend_from_slice(&crc32fast::hash(self.uid.as_bytes()).to_le_bytes());
        pack_bytes(&mut content, &message)?;

        Ok(format!("{}{}{}", VERSION, self.app_id, STANDARD.encode(content)))
    }
}

fn pack_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| anyhow!("field too long"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Room token for one uid. Publishers may send audio, video and data;
/// subscribers may only join.
pub fn build_token_with_uid(
    app_id: &str,
    app_certificate: &str,
    channel: &str,
    uid: u32,
    publisher: bool,
    now: u32,
    expire_at: u32,
) -> Result<String> {
    let mut token = AccessToken::new(app_id, app_certificate, channel, uid, now);
    token.add_privilege(Privilege::JoinChannel, expire_at);
    if publisher {
        token.add_privilege(Privilege::PublishAudioStream, expire_at);
        token.add_privilege(Privilege::PublishVideoStream, expire_at);
        token.add_privilege(Privilege::PublishDataStream, expire_at);
    }
    token.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_ID: &str = "970CA35de60c44645bbae8a215061b33";
    const CERT: &str = "5CFd2fd1755d40ecb72977518be15d3b";

    fn read_u16(buf: &[u8], at: &mut usize) -> u16 {
        let v = u16::from_le_bytes([buf[*at], buf[*at + 1]]);
        *at += 2;
        v
    }

    fn read_u32(buf: &[u8], at: &mut usize) -> u32 {
        let v = u32::from_le_bytes(buf[*at..*at + 4].try_into().unwrap());
        *at += 4;
        v
    }

    #[test]
    fn test_token_layout_and_signature() {
        let mut token = AccessToken::with_salt(APP_ID, CERT, "UP14AB1234", 2882341273, 1, 1111111);
        token.add_privilege(Privilege::JoinChannel, 1446455471);
        let built = token.build().unwrap();
        assert!(built.starts_with(&format!("006{}", APP_ID)));

        let content = STANDARD.decode(&built[3 + APP_ID.len()..]).unwrap();
        let mut at = 0;
        let sig_len = read_u16(&content, &mut at) as usize;
        assert_eq!(sig_len, 32);
        let signature = content[at..at + sig_len].to_vec();
        at += sig_len;
        assert_eq!(read_u32(&content, &mut at), crc32fast::hash(b"UP14AB1234"));
        assert_eq!(read_u32(&content, &mut at), crc32fast::hash(b"2882341273"));
        let msg_len = read_u16(&content, &mut at) as usize;
        let message = &content[at..at + msg_len];
        assert_eq!(at + msg_len, content.len());

        let mut m = 0;
        assert_eq!(read_u32(message, &mut m), 1);
        assert_eq!(read_u32(message, &mut m), 1111111);
        assert_eq!(read_u16(message, &mut m), 1);
        assert_eq!(read_u16(message, &mut m), Privilege::JoinChannel as u16);
        assert_eq!(read_u32(message, &mut m), 1446455471);

        let mut mac = HmacSha256::new_from_slice(CERT.as_bytes()).unwrap();
        mac.update(format!("{}UP14AB12342882341273", APP_ID).as_bytes());
        mac.update(message);
        mac.verify_slice(&signature).unwrap();
    }

    #[test]
    fn test_deterministic_for_fixed_salt() {
        let build = || {
            let mut t = AccessToken::with_salt(APP_ID, CERT, "UP14AB1234", 0, 42, 100);
            t.add_privilege(Privilege::JoinChannel, 200);
            t.build().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_uid_zero_signs_empty_string() {
        let built = build_token_with_uid(APP_ID, CERT, "C", 0, false, 0, 3600).unwrap();
        let content = STANDARD.decode(&built[3 + APP_ID.len()..]).unwrap();
        let mut at = 2 + 32 + 4;
        assert_eq!(read_u32(&content, &mut at), crc32fast::hash(b""));
    }

    #[test]
    fn test_publisher_carries_publish_privileges() {
        let privilege_count = |publisher| {
            let built =
                build_token_with_uid(APP_ID, CERT, "C", 7, publisher, 1000, 4600).unwrap();
            let content = STANDARD.decode(&built[3 + APP_ID.len()..]).unwrap();
            let mut at = 2 + 32 + 8 + 2 + 8;
            read_u16(&content, &mut at)
        };
        assert_eq!(privilege_count(true), 4);
        assert_eq!(privilege_count(false), 1);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(AccessToken::with_salt("", CERT, "C", 0, 1, 1).build().is_err());
        assert!(AccessToken::with_salt(APP_ID, "", "C", 0, 1, 1).build().is_err());
    }
}
