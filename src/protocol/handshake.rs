//! RTMP handshake implementation
//!
//! The handshake exchanges a version byte and three 1536-byte blocks per
//! side:
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version 3) ------>|
//!   |------- C1 (time+version+random) ---->|
//!   |<------ S0 (1 byte: version 3) -------|
//!   |<------ S1 (time+version+random) -----|
//!   |------- C2 (echo of S1) ------------->|
//!   |<------ S2 (echo of C1) --------------|
//!   |          [Handshake Complete]        |
//! ```
//!
//! The version field of C1 selects the mode. Zero means the simple
//! handshake: C2/S2 echo the peer's time and random block and both are
//! validated. Non-zero means the complex handshake: each 1536-byte block
//! hides an HMAC-SHA256 digest at a self-describing offset inside one of two
//! 764-byte sub-block layouts (schema 0: digest block first, schema 1: key
//! block first), and C2/S2 carry a trailing digest keyed with the digest
//! previously received from the peer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_RANDOM_SIZE, HANDSHAKE_SIZE, RTMP_VERSION};

type HmacSha256 = Hmac<Sha256>;

/// Digest length inside a handshake block
const DIGEST_SIZE: usize = 32;

/// Offset of the trailing C2/S2 digest
const ECHO_DIGEST_OFFSET: usize = HANDSHAKE_SIZE - DIGEST_SIZE;

/// Start of the digest sub-block under schema 0 (digest block first)
const SCHEMA0_DIGEST_BASE: usize = 8;

/// Start of the digest sub-block under schema 1 (key block first)
const SCHEMA1_DIGEST_BASE: usize = 8 + 764;

/// Random span of a 764-byte digest sub-block
const DIGEST_BLOCK_RANDOM: usize = 764 - DIGEST_SIZE - 4;

/// "Genuine Adobe Flash Media Server 001" + 32 binary bytes
const FMS_KEY: [u8; 68] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46,
    0x6c, 0x61, 0x73, 0x68, 0x20, 0x4d, 0x65, 0x64, 0x69, 0x61, 0x20, 0x53, 0x65, 0x72, 0x76,
    0x65, 0x72, 0x20, 0x30, 0x30, 0x31, 0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e,
    0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab,
    0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb, 0x31, 0xae,
];

/// "Genuine Adobe Flash Player 001" + 32 binary bytes
const FP_KEY: [u8; 62] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46,
    0x6c, 0x61, 0x73, 0x68, 0x20, 0x50, 0x6c, 0x61, 0x79, 0x65, 0x72, 0x20, 0x30, 0x30, 0x31,
    0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e,
    0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb,
    0x31, 0xae,
];

/// C1/S1 digests use the text prefix of the role key
const FP_KEY_PREFIX: usize = 30;
const FMS_KEY_PREFIX: usize = 36;

/// Handshake role (client or server)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Nothing sent or received yet
    Initial,
    /// Waiting for C0+C1 (server) or S0+S1 (client)
    AwaitPeerHello,
    /// Waiting for C2 (server) or S2 (client)
    AwaitPeerEcho,
    /// Handshake complete
    Done,
}

/// Handshake state machine, independent of the transport.
///
/// Feed received bytes to [`process`](Handshake::process); whatever it
/// returns goes onto the wire. [`bytes_needed`](Handshake::bytes_needed)
/// tells the IO loop how much to read before the next transition.
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    /// Version integer carried in our C1/S1 version field. Non-zero on the
    /// client side selects the complex handshake.
    version: u32,
    /// Whether the digest variant is active for this exchange
    complex: bool,
    our_time: u32,
    our_random: [u8; HANDSHAKE_RANDOM_SIZE],
    our_digest: [u8; DIGEST_SIZE],
    peer_time: u32,
    peer_version: u32,
    peer_random: [u8; HANDSHAKE_RANDOM_SIZE],
    peer_digest: [u8; DIGEST_SIZE],
}

impl Handshake {
    /// Create a handshake state machine.
    ///
    /// `version` is the implementation version advertised in the C1/S1
    /// version field; on the client side a non-zero value requests the
    /// complex handshake.
    pub fn new(role: HandshakeRole, version: u32) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            version,
            complex: role == HandshakeRole::Client && version != 0,
            our_time: 0,
            our_random: [0; HANDSHAKE_RANDOM_SIZE],
            our_digest: [0; DIGEST_SIZE],
            peer_time: 0,
            peer_version: 0,
            peer_random: [0; HANDSHAKE_RANDOM_SIZE],
            peer_digest: [0; DIGEST_SIZE],
        }
    }

    /// Check if the handshake is complete
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Version field the peer carried in its C1/S1
    pub fn peer_version(&self) -> u32 {
        self.peer_version
    }

    /// Bytes required before [`process`](Handshake::process) can advance
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            HandshakeState::Initial => 0,
            HandshakeState::AwaitPeerHello => 1 + HANDSHAKE_SIZE,
            HandshakeState::AwaitPeerEcho => HANDSHAKE_SIZE,
            HandshakeState::Done => 0,
        }
    }

    /// Produce the opening bytes.
    ///
    /// The client returns C0+C1; the server returns nothing and waits.
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::AwaitPeerHello;

        match self.role {
            HandshakeRole::Client => {
                let mut block = self.build_hello();
                if self.complex {
                    self.our_digest =
                        write_digest(&mut block, &FP_KEY[..FP_KEY_PREFIX]);
                }

                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&block);
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Process received bytes and return the response to write, if any.
    ///
    /// Consumes input only when a full packet for the current state is
    /// buffered; call again after reading more otherwise.
    pub fn process(&mut self, data: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.state {
            HandshakeState::AwaitPeerHello => {
                if data.len() < 1 + HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let version = data.get_u8();
                if version != RTMP_VERSION {
                    return Err(HandshakeError::InvalidProtocolVersion(version).into());
                }

                let mut block = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut block);
                self.peer_time = read_u32(&block, 0);
                self.peer_version = read_u32(&block, 4);

                match self.role {
                    HandshakeRole::Server => self.accept_c1(&block).map(Some),
                    HandshakeRole::Client => self.accept_s1(&block).map(Some),
                }
            }
            HandshakeState::AwaitPeerEcho => {
                if data.len() < HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let mut block = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut block);

                match self.role {
                    HandshakeRole::Server => {
                        self.verify_echo(&block, "C2", HandshakeError::DigestC2Failed)?;
                        let s2 = self.build_echo();
                        self.state = HandshakeState::Done;
                        Ok(Some(s2))
                    }
                    HandshakeRole::Client => {
                        self.verify_echo(&block, "S2", HandshakeError::DigestS2Failed)?;
                        self.state = HandshakeState::Done;
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }

    /// Server side: C1 received, answer with S0+S1
    fn accept_c1(&mut self, c1: &[u8; HANDSHAKE_SIZE]) -> Result<Bytes> {
        self.complex = self.peer_version != 0;

        if self.complex {
            self.peer_digest = find_digest(c1, &FP_KEY[..FP_KEY_PREFIX])
                .ok_or(HandshakeError::DigestC1Failed)?;
        } else {
            self.peer_random.copy_from_slice(&c1[8..]);
        }

        let mut s1 = self.build_hello();
        if self.complex {
            self.our_digest = write_digest(&mut s1, &FMS_KEY[..FMS_KEY_PREFIX]);
        }

        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        buf.put_u8(RTMP_VERSION);
        buf.put_slice(&s1);
        self.state = HandshakeState::AwaitPeerEcho;
        Ok(buf.freeze())
    }

    /// Client side: S1 received, answer with C2
    fn accept_s1(&mut self, s1: &[u8; HANDSHAKE_SIZE]) -> Result<Bytes> {
        if self.complex {
            self.peer_digest = find_digest(s1, &FMS_KEY[..FMS_KEY_PREFIX])
                .ok_or(HandshakeError::DigestS1Failed)?;
        } else {
            self.peer_random.copy_from_slice(&s1[8..]);
        }

        let c2 = self.build_echo();
        self.state = HandshakeState::AwaitPeerEcho;
        Ok(c2)
    }

    /// Build our C1/S1 block: time, version, fresh random
    fn build_hello(&mut self) -> [u8; HANDSHAKE_SIZE] {
        self.our_time = unix_time();
        rand::thread_rng().fill_bytes(&mut self.our_random);

        let mut block = [0u8; HANDSHAKE_SIZE];
        block[0..4].copy_from_slice(&self.our_time.to_be_bytes());
        block[4..8].copy_from_slice(&self.version.to_be_bytes());
        block[8..].copy_from_slice(&self.our_random);
        block
    }

    /// Build the C2/S2 echo of the peer's hello
    fn build_echo(&self) -> Bytes {
        let mut block = [0u8; HANDSHAKE_SIZE];
        block[0..4].copy_from_slice(&self.peer_time.to_be_bytes());
        block[4..8].copy_from_slice(&unix_time().to_be_bytes());

        if self.complex {
            rand::thread_rng().fill_bytes(&mut block[8..ECHO_DIGEST_OFFSET]);
            let digest = hmac_sha256(&self.peer_digest, &[&block[..ECHO_DIGEST_OFFSET]]);
            block[ECHO_DIGEST_OFFSET..].copy_from_slice(&digest);
        } else {
            block[8..].copy_from_slice(&self.peer_random);
        }

        Bytes::copy_from_slice(&block)
    }

    /// Validate the peer's echo of our hello
    fn verify_echo(
        &self,
        block: &[u8; HANDSHAKE_SIZE],
        which: &'static str,
        digest_err: HandshakeError,
    ) -> Result<()> {
        let time1 = read_u32(block, 0);
        if time1 != self.our_time {
            return Err(HandshakeError::TimeEchoMismatch {
                which,
                expected: self.our_time,
                actual: time1,
            }
            .into());
        }

        if self.complex {
            let expected = hmac_sha256(&self.our_digest, &[&block[..ECHO_DIGEST_OFFSET]]);
            if expected[..] != block[ECHO_DIGEST_OFFSET..] {
                return Err(digest_err.into());
            }
        } else {
            for (index, (sent, echoed)) in
                self.our_random.iter().zip(&block[8..]).enumerate()
            {
                if sent != echoed {
                    return Err(HandshakeError::RandomEchoMismatch { which, index }.into());
                }
            }
        }

        Ok(())
    }
}

/// Current unix time in seconds, truncated to the 32-bit wire field
fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn read_u32(block: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        block[offset],
        block[offset + 1],
        block[offset + 2],
        block[offset + 3],
    ])
}

/// HMAC-SHA256 over the concatenation of `parts`
fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Digest slice offset inside the sub-block starting at `base`: the first
/// four bytes of the sub-block sum to an offset within its random span.
fn digest_offset(block: &[u8; HANDSHAKE_SIZE], base: usize) -> usize {
    let sum = block[base] as usize
        + block[base + 1] as usize
        + block[base + 2] as usize
        + block[base + 3] as usize;
    base + 4 + sum % DIGEST_BLOCK_RANDOM
}

/// Compute and store the digest for a freshly built C1/S1 under schema 0.
/// The HMAC covers the whole block except the digest slice itself.
fn write_digest(block: &mut [u8; HANDSHAKE_SIZE], key: &[u8]) -> [u8; DIGEST_SIZE] {
    let offset = digest_offset(block, SCHEMA0_DIGEST_BASE);
    let digest = hmac_sha256(key, &[&block[..offset], &block[offset + DIGEST_SIZE..]]);
    block[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
    digest
}

/// Locate and verify the digest of a received C1/S1, trying schema 0 then
/// schema 1. Returns the digest when one of them verifies.
fn find_digest(block: &[u8; HANDSHAKE_SIZE], key: &[u8]) -> Option<[u8; DIGEST_SIZE]> {
    for base in [SCHEMA0_DIGEST_BASE, SCHEMA1_DIGEST_BASE] {
        let offset = digest_offset(block, base);
        let computed = hmac_sha256(key, &[&block[..offset], &block[offset + DIGEST_SIZE..]]);
        if computed[..] == block[offset..offset + DIGEST_SIZE] {
            return Some(computed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn drive(client: &mut Handshake, server: &mut Handshake) {
        let c0c1 = client.generate_initial().expect("client sends C0C1");
        assert!(server.generate_initial().is_none());

        let mut buf = BytesMut::from(&c0c1[..]);
        let s0s1 = server.process(&mut buf).unwrap().expect("server sends S0S1");
        assert_eq!(s0s1.len(), 1 + HANDSHAKE_SIZE);

        let mut buf = BytesMut::from(&s0s1[..]);
        let c2 = client.process(&mut buf).unwrap().expect("client sends C2");
        assert_eq!(c2.len(), HANDSHAKE_SIZE);

        let mut buf = BytesMut::from(&c2[..]);
        let s2 = server.process(&mut buf).unwrap().expect("server sends S2");
        assert_eq!(s2.len(), HANDSHAKE_SIZE);
        assert!(server.is_done());

        let mut buf = BytesMut::from(&s2[..]);
        assert!(client.process(&mut buf).unwrap().is_none());
        assert!(client.is_done());
    }

    #[test]
    fn test_simple_handshake_roundtrip() {
        let mut client = Handshake::new(HandshakeRole::Client, 0);
        let mut server = Handshake::new(HandshakeRole::Server, 1);
        drive(&mut client, &mut server);
        assert_eq!(client.peer_version(), 1);
        assert_eq!(server.peer_version(), 0);
    }

    #[test]
    fn test_complex_handshake_roundtrip() {
        let mut client = Handshake::new(HandshakeRole::Client, 0x0A00_0103);
        let mut server = Handshake::new(HandshakeRole::Server, 5);
        drive(&mut client, &mut server);
        assert_eq!(server.peer_version(), 0x0A00_0103);
        assert!(server.complex);
        assert!(client.complex);
    }

    #[test]
    fn test_server_echoes_client_hello() {
        // Scenario: C1 with time=1000, version=0 and a constant random fill.
        let mut server = Handshake::new(HandshakeRole::Server, 7);
        server.generate_initial();

        let mut c0c1 = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        c0c1.put_u8(RTMP_VERSION);
        c0c1.put_u32(1000);
        c0c1.put_u32(0);
        c0c1.put_slice(&[0xA5; HANDSHAKE_RANDOM_SIZE]);

        let s0s1 = server.process(&mut c0c1).unwrap().unwrap();
        assert_eq!(s0s1[0], RTMP_VERSION);
        let s1 = &s0s1[1..];
        let s1_time = read_u32(s1, 0);
        assert_eq!(read_u32(s1, 4), 7);

        // C2 echoes S1.
        let mut c2 = BytesMut::with_capacity(HANDSHAKE_SIZE);
        c2.put_u32(s1_time);
        c2.put_u32(9999);
        c2.put_slice(&s1[8..]);

        let s2 = server.process(&mut c2).unwrap().unwrap();
        assert!(server.is_done());

        // S2 echoes C1's time and random.
        assert_eq!(read_u32(&s2, 0), 1000);
        assert!(s2[8..].iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_invalid_protocol_version() {
        let mut server = Handshake::new(HandshakeRole::Server, 0);
        server.generate_initial();

        let mut bad = BytesMut::new();
        bad.put_u8(6);
        bad.put_slice(&[0u8; HANDSHAKE_SIZE]);

        match server.process(&mut bad) {
            Err(Error::Handshake(HandshakeError::InvalidProtocolVersion(6))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_bad_c2_random_rejected() {
        let mut client = Handshake::new(HandshakeRole::Client, 0);
        let mut server = Handshake::new(HandshakeRole::Server, 0);

        let c0c1 = client.generate_initial().unwrap();
        server.generate_initial();
        let mut buf = BytesMut::from(&c0c1[..]);
        let s0s1 = server.process(&mut buf).unwrap().unwrap();

        let mut buf = BytesMut::from(&s0s1[..]);
        let c2 = client.process(&mut buf).unwrap().unwrap();

        // Corrupt one random byte of the echo.
        let mut tampered = BytesMut::from(&c2[..]);
        tampered[100] ^= 0xFF;

        match server.process(&mut tampered) {
            Err(Error::Handshake(HandshakeError::RandomEchoMismatch { which: "C2", .. })) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_tampered_c1_digest_rejected() {
        let mut client = Handshake::new(HandshakeRole::Client, 1);
        let mut server = Handshake::new(HandshakeRole::Server, 1);

        let c0c1 = client.generate_initial().unwrap();
        server.generate_initial();

        let mut tampered = BytesMut::from(&c0c1[..]);
        // Flip a byte in the middle of the block; some offset of it is the
        // digest or its coverage either way.
        tampered[700] ^= 0x01;

        match server.process(&mut tampered) {
            Err(Error::Handshake(HandshakeError::DigestC1Failed)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_digest_write_then_find() {
        let mut block = [0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut block);

        let written = write_digest(&mut block, &FP_KEY[..FP_KEY_PREFIX]);
        let found = find_digest(&block, &FP_KEY[..FP_KEY_PREFIX]).expect("digest verifies");
        assert_eq!(written, found);

        // The wrong key must not verify.
        assert!(find_digest(&block, &FMS_KEY[..FMS_KEY_PREFIX]).is_none());
    }

    #[test]
    fn test_bytes_needed_progression() {
        let mut server = Handshake::new(HandshakeRole::Server, 0);
        assert_eq!(server.bytes_needed(), 0);
        server.generate_initial();
        assert_eq!(server.bytes_needed(), 1 + HANDSHAKE_SIZE);
    }

    #[test]
    fn test_partial_input_is_not_consumed() {
        let mut server = Handshake::new(HandshakeRole::Server, 0);
        server.generate_initial();

        let mut partial = BytesMut::new();
        partial.put_u8(RTMP_VERSION);
        partial.put_slice(&[0u8; 100]);

        assert!(server.process(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 101);
    }
}
