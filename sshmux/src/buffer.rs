// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// https://tools.ietf.org/html/rfc4251#section-5

//! Codec for SSH wire types over a growable byte buffer with
//! independent read and write cursors.

use byteorder::{BigEndian, ByteOrder};
use num_bigint::BigInt;
use num_bigint::Sign;

use crate::Error;

/// Number of bytes left in front of an outgoing payload for the
/// transport to stamp the packet-length and padding-length fields.
pub const PACKET_HEADER_LEN: usize = 5;

/// Buffer growth policy used by [`Buffer::ensure_capacity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Grow by a fixed delta (must be non-zero to stay strictly
    /// increasing).
    Add(usize),
    /// Double the capacity.
    Double,
}

impl Default for Growth {
    fn default() -> Self {
        Growth::Add(8)
    }
}

impl Growth {
    /// Smallest capacity `>= needed` reachable from `current` under
    /// this policy.
    fn grow_to(self, current: usize, needed: usize) -> usize {
        match self {
            Growth::Add(delta) => {
                let delta = delta.max(1);
                let missing = needed - current;
                current + missing.div_ceil(delta) * delta
            }
            Growth::Double => {
                let mut cap = current.max(64);
                while cap < needed {
                    cap *= 2;
                }
                cap
            }
        }
    }
}

/// A byte buffer holding SSH wire types, with a read position and a
/// write position. Invariant: `0 <= rpos <= wpos <= capacity`.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity],
            rpos: 0,
            wpos: 0,
        }
    }

    /// A buffer holding an outgoing packet payload: bytes `[0..5)` are
    /// reserved for the transport header, the message-type byte comes
    /// next, and both cursors start past the reservation.
    pub fn packet(msg: u8) -> Buffer {
        let mut b = Buffer {
            data: vec![0; PACKET_HEADER_LEN + 64],
            rpos: PACKET_HEADER_LEN,
            wpos: PACKET_HEADER_LEN,
        };
        b.put_u8(msg);
        b
    }

    /// Wrap received bytes for decoding.
    pub fn from_slice(s: &[u8]) -> Buffer {
        Buffer {
            data: s.to_vec(),
            rpos: 0,
            wpos: s.len(),
        }
    }

    pub fn rpos(&self) -> usize {
        self.rpos
    }

    pub fn set_rpos(&mut self, rpos: usize) {
        debug_assert!(rpos <= self.wpos);
        self.rpos = rpos.min(self.wpos);
    }

    pub fn wpos(&self) -> usize {
        self.wpos
    }

    pub fn set_wpos(&mut self, wpos: usize) {
        if wpos > self.data.len() {
            self.data.resize(wpos, 0);
        }
        self.wpos = wpos;
        self.rpos = self.rpos.min(self.wpos);
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread bytes.
    pub fn available(&self) -> usize {
        self.wpos - self.rpos
    }

    /// The bytes between the cursors. For a packet buffer this starts
    /// at the message-type byte, past the reserved header.
    pub fn payload(&self) -> &[u8] {
        #[allow(clippy::indexing_slicing)] // rpos <= wpos <= len
        &self.data[self.rpos..self.wpos]
    }

    /// The full backing store up to `wpos`, including the reserved
    /// header of a packet buffer. This is what the transport consumes.
    pub fn as_framed(&self) -> &[u8] {
        #[allow(clippy::indexing_slicing)] // wpos <= len
        &self.data[..self.wpos]
    }

    /// Grow the backing store so that at least `n` more bytes can be
    /// written.
    pub fn ensure_capacity(&mut self, n: usize, growth: Growth) {
        let needed = self.wpos + n;
        if needed > self.data.len() {
            let cap = growth.grow_to(self.data.len(), needed);
            self.data.resize(cap, 0);
        }
    }

    /// Shift unread bytes to offset 0.
    pub fn compact(&mut self) {
        if self.rpos > 0 {
            self.data.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }
    }

    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    // Writers.

    pub fn put_u8(&mut self, x: u8) {
        self.ensure_capacity(1, Growth::default());
        #[allow(clippy::indexing_slicing)] // capacity ensured
        {
            self.data[self.wpos] = x;
        }
        self.wpos += 1;
    }

    pub fn put_bool(&mut self, x: bool) {
        self.put_u8(u8::from(x));
    }

    pub fn put_u32(&mut self, x: u32) {
        self.ensure_capacity(4, Growth::default());
        #[allow(clippy::indexing_slicing)] // capacity ensured
        BigEndian::write_u32(&mut self.data[self.wpos..], x);
        self.wpos += 4;
    }

    pub fn put_u64(&mut self, x: u64) {
        self.ensure_capacity(8, Growth::default());
        #[allow(clippy::indexing_slicing)] // capacity ensured
        BigEndian::write_u64(&mut self.data[self.wpos..], x);
        self.wpos += 8;
    }

    /// Raw bytes, no length prefix.
    pub fn put_raw(&mut self, s: &[u8]) {
        self.ensure_capacity(s.len(), Growth::default());
        #[allow(clippy::indexing_slicing)] // capacity ensured
        self.data[self.wpos..self.wpos + s.len()].copy_from_slice(s);
        self.wpos += s.len();
    }

    /// An SSH `string`: `uint32` length followed by the bytes.
    pub fn put_string(&mut self, s: &[u8]) {
        self.put_u32(s.len() as u32);
        self.put_raw(s);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_string(s.as_bytes());
    }

    /// An SSH `name-list`: comma-joined names as one string.
    pub fn put_name_list<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = names
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.put_string(joined.as_bytes());
    }

    /// An SSH `mpint`: two's-complement big-endian with a minimal
    /// leading byte; zero is the empty string.
    pub fn put_mpint(&mut self, x: &BigInt) {
        if x.sign() == Sign::NoSign {
            self.put_u32(0);
        } else {
            self.put_string(&x.to_signed_bytes_be());
        }
    }

    /// An opaque public-key blob, as an SSH string.
    pub fn put_public_key(&mut self, key: &ssh_key::PublicKey) -> Result<(), Error> {
        let blob = key.to_bytes()?;
        self.put_string(&blob);
        Ok(())
    }

    /// Overwrite four bytes at an absolute offset, for length fields
    /// whose value is only known once the rest is written.
    pub fn patch_u32(&mut self, at: usize, x: u32) -> Result<(), Error> {
        if at + 4 > self.wpos {
            return Err(Error::BufferUnderrun {
                needed: 4,
                available: self.wpos.saturating_sub(at),
            });
        }
        #[allow(clippy::indexing_slicing)] // length checked
        BigEndian::write_u32(&mut self.data[at..], x);
        Ok(())
    }

    // Readers.

    fn check(&self, needed: usize) -> Result<(), Error> {
        if self.available() < needed {
            Err(Error::BufferUnderrun {
                needed,
                available: self.available(),
            })
        } else {
            Ok(())
        }
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        self.check(1)?;
        #[allow(clippy::indexing_slicing)] // length checked
        let x = self.data[self.rpos];
        self.rpos += 1;
        Ok(x)
    }

    pub fn get_bool(&mut self) -> Result<bool, Error> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        self.check(4)?;
        #[allow(clippy::indexing_slicing)] // length checked
        let x = BigEndian::read_u32(&self.data[self.rpos..]);
        self.rpos += 4;
        Ok(x)
    }

    pub fn get_u64(&mut self) -> Result<u64, Error> {
        self.check(8)?;
        #[allow(clippy::indexing_slicing)] // length checked
        let x = BigEndian::read_u64(&self.data[self.rpos..]);
        self.rpos += 8;
        Ok(x)
    }

    pub fn get_raw(&mut self, n: usize) -> Result<&[u8], Error> {
        self.check(n)?;
        #[allow(clippy::indexing_slicing)] // length checked
        let s = &self.data[self.rpos..self.rpos + n];
        self.rpos += n;
        Ok(s)
    }

    pub fn get_string(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.get_u32()?;
        if len as usize > self.available() {
            return Err(Error::BadStringLength(len));
        }
        Ok(self.get_raw(len as usize)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, Error> {
        let s = self.get_string()?;
        Ok(std::str::from_utf8(&s)?.to_string())
    }

    pub fn get_name_list(&mut self) -> Result<Vec<String>, Error> {
        let s = self.get_str()?;
        if s.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(s.split(',').map(|x| x.to_string()).collect())
        }
    }

    pub fn get_mpint(&mut self) -> Result<BigInt, Error> {
        let s = self.get_string()?;
        if s.is_empty() {
            Ok(BigInt::from(0))
        } else {
            Ok(BigInt::from_signed_bytes_be(&s))
        }
    }

    pub fn get_public_key(&mut self) -> Result<ssh_key::PublicKey, Error> {
        let blob = self.get_string()?;
        Ok(ssh_key::PublicKey::from_bytes(&blob)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]

    use super::*;

    #[test]
    fn cursor_invariants() {
        let mut b = Buffer::new();
        b.put_u32(42);
        b.put_str("hello");
        assert_eq!(b.rpos(), 0);
        assert_eq!(b.wpos(), 13);
        assert_eq!(b.available(), 13);
        assert_eq!(b.get_u32().unwrap(), 42);
        assert_eq!(b.available(), 9);
        b.compact();
        assert_eq!(b.rpos(), 0);
        assert_eq!(b.wpos(), 9);
        assert_eq!(b.get_str().unwrap(), "hello");
    }

    #[test]
    fn round_trip_scalars() {
        let mut b = Buffer::new();
        b.put_u8(0x7f);
        b.put_bool(true);
        b.put_bool(false);
        b.put_u32(0xdeadbeef);
        b.put_u64(0x0123456789abcdef);
        assert_eq!(b.get_u8().unwrap(), 0x7f);
        assert!(b.get_bool().unwrap());
        assert!(!b.get_bool().unwrap());
        assert_eq!(b.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(b.get_u64().unwrap(), 0x0123456789abcdef);
    }

    #[test]
    fn round_trip_strings() {
        let mut b = Buffer::new();
        b.put_string(b"");
        b.put_str("abc");
        b.put_name_list(["a", "b", "c"]);
        b.put_name_list(Vec::<String>::new());
        assert_eq!(b.get_string().unwrap(), b"");
        assert_eq!(b.get_str().unwrap(), "abc");
        assert_eq!(b.get_name_list().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(b.get_name_list().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn round_trip_mpints() {
        // Negative values need a leading 0xFF byte, positive values with
        // the high bit set a leading 0x00; zero is the empty string.
        for x in [0i64, 1, -1, 127, 128, 255, -128, -129, 0x9a378f9b2e332a7i64] {
            let mut b = Buffer::new();
            b.put_mpint(&BigInt::from(x));
            assert_eq!(b.get_mpint().unwrap(), BigInt::from(x), "mpint {x}");
        }
        let mut b = Buffer::new();
        b.put_mpint(&BigInt::from(0));
        assert_eq!(b.payload(), &[0, 0, 0, 0]);
        let mut b = Buffer::new();
        b.put_mpint(&BigInt::from(0x80u32));
        assert_eq!(b.payload(), &[0, 0, 0, 2, 0, 0x80]);
        let mut b = Buffer::new();
        b.put_mpint(&BigInt::from(-1));
        assert_eq!(b.payload(), &[0, 0, 0, 1, 0xff]);
    }

    #[test]
    fn underrun_is_an_error() {
        let mut b = Buffer::from_slice(&[0, 0, 0]);
        assert!(matches!(
            b.get_u32(),
            Err(Error::BufferUnderrun {
                needed: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn oversized_string_length_is_an_error() {
        let mut b = Buffer::new();
        b.put_u32(100);
        b.put_raw(b"short");
        assert!(matches!(b.get_string(), Err(Error::BadStringLength(100))));
    }

    #[test]
    fn packet_reserves_header() {
        let mut b = Buffer::packet(94);
        b.put_u32(3);
        assert_eq!(b.rpos(), PACKET_HEADER_LEN);
        assert_eq!(b.payload(), &[94, 0, 0, 0, 3]);
        assert_eq!(b.as_framed().len(), PACKET_HEADER_LEN + 5);
        assert_eq!(&b.as_framed()[..PACKET_HEADER_LEN], &[0; PACKET_HEADER_LEN]);
    }

    #[test]
    fn growth_policies() {
        assert_eq!(Growth::Add(8).grow_to(0, 5), 8);
        assert_eq!(Growth::Add(8).grow_to(8, 9), 16);
        assert_eq!(Growth::Double.grow_to(64, 65), 128);
        // Strictly increasing even with a degenerate delta.
        assert_eq!(Growth::Add(0).grow_to(3, 4), 4);
    }
}
