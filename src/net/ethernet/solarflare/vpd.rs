//! PCI Vital Product Data image kept at the start of the dynamic
//! configuration partition.
//!
//! The image is a sequence of PCI VPD resources: a large-resource ID string,
//! a read-only keyword section closed by the `RV` checksum, an optional
//! read-write keyword section, and the small-resource end tag.

use super::adapter::Adapter;
use super::nvram::NvramType;
use crate::{Result, SfvmkError};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;

pub const VPD_TAG_ID: u8 = 0x02;
pub const VPD_TAG_RO: u8 = 0x10;
pub const VPD_TAG_RW: u8 = 0x11;
pub const VPD_TAG_END: u8 = 0x0f;

const VPD_LARGE_RESOURCE: u8 = 0x80;

/// Largest value a management VPD request can carry.
pub const VPD_MAX_PAYLOAD: usize = 0x100;
/// Largest single keyword value.
pub const VPD_MAX_VALUE: usize = 0xff;
/// Bytes of the dynamic configuration partition reserved for VPD.
pub const VPD_REGION_MAX: usize = 0x400;

/// Two-character keyword packed as it appears in the image.
pub const fn keyword(c0: u8, c1: u8) -> u16 {
    c0 as u16 | (c1 as u16) << 8
}

pub const VPD_KEYWORD_RV: u16 = keyword(b'R', b'V');

#[derive(Clone, Debug, PartialEq, Eq)]
struct VpdField {
    tag: u8,
    keyword: u16,
    value: Vec<u8>,
}

/// Decoded VPD image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VpdImage {
    fields: Vec<VpdField>,
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).ok_or(SfvmkError::IoError)?;
    let bytes = buf.get(*pos..end).ok_or(SfvmkError::IoError)?;
    *pos = end;
    Ok(bytes)
}

impl VpdImage {
    /// Decode and verify an image, including the read-only checksum.
    pub fn parse(buf: &[u8]) -> Result<VpdImage> {
        let mut image = VpdImage::default();
        let mut pos = 0;
        let mut checksummed = false;

        loop {
            let hdr = take(buf, &mut pos, 1)?[0];
            let (tag, len) = if hdr & VPD_LARGE_RESOURCE != 0 {
                let len = take(buf, &mut pos, 2)?;
                (hdr & !VPD_LARGE_RESOURCE, usize::from(len[0]) | usize::from(len[1]) << 8)
            } else {
                ((hdr >> 3) & 0xf, usize::from(hdr & 0x7))
            };
            let start = pos;
            let data = take(buf, &mut pos, len)?;

            match tag {
                VPD_TAG_END => break,
                // A zero-length identifier is what encode emits when none is set
                VPD_TAG_ID if data.is_empty() => {}
                VPD_TAG_ID => image.fields.push(VpdField {
                    tag,
                    keyword: 0,
                    value: data.to_vec(),
                }),
                VPD_TAG_RO | VPD_TAG_RW => {
                    let mut off = 0;
                    while off < data.len() {
                        let kw = take(data, &mut off, 2)?;
                        let kw = keyword(kw[0], kw[1]);
                        let vlen = usize::from(take(data, &mut off, 1)?[0]);
                        let value_start = off;
                        let value = take(data, &mut off, vlen)?;
                        if tag == VPD_TAG_RO && kw == VPD_KEYWORD_RV {
                            // Sum runs from the image start through the checksum byte
                            let sum = buf[..=start + value_start]
                                .iter()
                                .fold(0u8, |acc, b| acc.wrapping_add(*b));
                            if vlen == 0 || sum != 0 {
                                return Err(SfvmkError::IoError);
                            }
                            checksummed = true;
                            continue;
                        }
                        image.fields.push(VpdField {
                            tag,
                            keyword: kw,
                            value: value.to_vec(),
                        });
                    }
                }
                _ => return Err(SfvmkError::IoError),
            }
        }

        if !checksummed {
            return Err(SfvmkError::IoError);
        }
        Ok(image)
    }

    pub fn verify(buf: &[u8]) -> Result {
        VpdImage::parse(buf).map(|_| ())
    }

    pub fn get(&self, tag: u8, kw: u16) -> Option<&[u8]> {
        let kw = if tag == VPD_TAG_ID { 0 } else { kw };
        self.fields
            .iter()
            .find(|f| f.tag == tag && f.keyword == kw)
            .map(|f| f.value.as_slice())
    }

    /// Add or replace a value. The checksum keyword is managed by [`VpdImage::encode`].
    pub fn set(&mut self, tag: u8, kw: u16, value: &[u8]) -> Result {
        if value.len() > VPD_MAX_VALUE {
            return Err(SfvmkError::BadParam);
        }
        let kw = match tag {
            VPD_TAG_ID => 0,
            VPD_TAG_RO if kw == VPD_KEYWORD_RV => return Err(SfvmkError::BadParam),
            VPD_TAG_RO | VPD_TAG_RW => kw,
            _ => return Err(SfvmkError::BadParam),
        };
        match self.fields.iter_mut().find(|f| f.tag == tag && f.keyword == kw) {
            Some(field) => field.value = value.to_vec(),
            None => self.fields.push(VpdField {
                tag,
                keyword: kw,
                value: value.to_vec(),
            }),
        }
        Ok(())
    }

    fn push_large(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
        out.push(VPD_LARGE_RESOURCE | tag);
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.extend_from_slice(body);
    }

    fn keywords(&self, tag: u8) -> Vec<u8> {
        let mut body = Vec::new();
        for field in self.fields.iter().filter(|f| f.tag == tag) {
            body.extend_from_slice(&field.keyword.to_le_bytes());
            body.push(field.value.len() as u8);
            body.extend_from_slice(&field.value);
        }
        body
    }

    /// Encode into a `size`-byte region, padding the tail with 0xff.
    pub fn encode(&self, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);

        let id = self.get(VPD_TAG_ID, 0).unwrap_or(&[]);
        VpdImage::push_large(&mut out, VPD_TAG_ID, id);

        let mut ro = self.keywords(VPD_TAG_RO);
        ro.extend_from_slice(&VPD_KEYWORD_RV.to_le_bytes());
        ro.push(1);
        ro.push(0);
        VpdImage::push_large(&mut out, VPD_TAG_RO, &ro);
        let sum = out.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if let Some(last) = out.last_mut() {
            *last = 0u8.wrapping_sub(sum);
        }

        let rw = self.keywords(VPD_TAG_RW);
        if !rw.is_empty() {
            VpdImage::push_large(&mut out, VPD_TAG_RW, &rw);
        }
        out.push(VPD_TAG_END << 3);

        if out.len() > size {
            return Err(SfvmkError::NoSpace);
        }
        out.resize(size, 0xff);
        Ok(out)
    }

    /// An empty but valid image of `size` bytes.
    pub fn reinit(size: usize) -> Result<Vec<u8>> {
        VpdImage::default().encode(size)
    }
}

impl Adapter {
    fn vpd_read_region(&self) -> Result<Vec<u8>> {
        let size = min(self.nvram_size(NvramType::DynamicCfg)?, VPD_REGION_MAX);
        let mut buf = vec![0u8; size];
        self.nvram_read(NvramType::DynamicCfg, 0, &mut buf)?;
        Ok(buf)
    }

    /// Value stored under (`tag`, `keyword`).
    pub fn vpd_get_by_tag(&self, tag: u8, kw: u16) -> Result<Vec<u8>> {
        let buf = self.vpd_read_region()?;
        let image = VpdImage::parse(&buf).map_err(|err| {
            drv_error!("sfvmk {}: VPD verify failed: {}", self.name(), err);
            err
        })?;
        let value = image.get(tag, kw).ok_or(SfvmkError::NotFound)?;
        if value.len() > VPD_MAX_PAYLOAD {
            return Err(SfvmkError::NoSpace);
        }
        Ok(value.to_vec())
    }

    /// Store `value` under (`tag`, `keyword`), reinitialising a corrupt image.
    pub fn vpd_set_by_tag(&self, tag: u8, kw: u16, value: &[u8]) -> Result {
        let buf = self.vpd_read_region()?;
        let mut image = match VpdImage::parse(&buf) {
            Ok(image) => image,
            Err(_) => {
                drv_warn!("sfvmk {}: VPD image invalid, reinitialising", self.name());
                VpdImage::parse(&VpdImage::reinit(buf.len())?)?
            }
        };
        image.set(tag, kw, value)?;
        let encoded = image.encode(buf.len())?;
        VpdImage::verify(&encoded)?;
        self.nvram_write(NvramType::DynamicCfg, 0, &encoded)
    }
}
