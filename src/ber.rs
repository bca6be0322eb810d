//! ISO 7816 flavoured BER-TLV (Tag-Length-Value) decoding.
//!
//! BER is an ASN.1 encoding, originally documented in ISO 8825, but the subset
//! used by payment cards is the slightly odd dialect of ISO 7816-6, recapped in
//! EMV Book 3, Annex B (freely available from EMVCo's website). The ecosystem
//! convention is to refer to tags by their hex values (0x6F rather than
//! Application 15), and this module follows it.
//!
//! Issuers are not reliably good at BER. Cards in the field return truncated
//! records, lengths that overrun the response, and tags nobody has documented,
//! so the decoder here is tolerant: it never fails, it decodes as far as the
//! input allows and reports how far it got in a [`Summary`].

use byteorder::{BigEndian, ByteOrder};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Constructed templates the decoder recurses into automatically.
///
/// 0x70 record template, 0x77 response message template, 0xA5 FCI proprietary
/// template, 0x6F FCI template, 0x61 directory entry, 0xBF0C FCI issuer
/// discretionary data. Any other constructed tag is kept as raw payload;
/// interpreting unknown structure is the caller's decision, not ours.
pub const TEMPLATES: [u16; 6] = [0x70, 0x77, 0xA5, 0x6F, 0x61, 0xBF0C];

/// Recursion bound. EMV data in the wild nests three, maybe four levels deep.
const MAX_DEPTH: usize = 16;

/// A single decoded TLV node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<'a> {
    pub tag: u16,
    pub value: Value<'a>,
}

/// A node's payload: raw bytes, or child nodes for the known templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Primitive(&'a [u8]),
    Constructed(Vec<Node<'a>>),
}

/// Why [`decode`] stopped before the end of the input, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Ran out of bytes mid tag or length field.
    TruncatedHeader,
    /// A tag with a third identifier byte; we only support 1- and 2-byte tags.
    OversizeTag,
    /// A length form EMV forbids: indeterminate, or more than 4 length bytes.
    UnsupportedLength,
    /// A declared length ran past the end of the slice and was clamped.
    LengthClamped,
    /// A constructed tag with a zero-length body.
    ZeroLengthConstructed,
    /// Nesting deeper than [`MAX_DEPTH`]; the offending body is kept raw.
    DepthLimit,
}

/// Decode diagnostics: how much input was consumed, and why we stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub consumed: usize,
    pub remaining: usize,
    pub stop: Option<Stop>,
}

/// Does this tag represent a constructed value?
///
/// A constructed value contains further TLV tuples; a primitive value is a
/// value in itself (a string, number, etc. depending on context).
pub fn is_constructed(tag: u16) -> bool {
    first_tag_byte(tag) & (1 << 5) != 0
}

fn first_tag_byte(tag: u16) -> u8 {
    if tag > 0xFF {
        (tag >> 8) as u8
    } else {
        tag as u8
    }
}

/// Parses a tag into its integer form.
///
/// If bits 1-5 of the first byte are all set, one more byte follows and the tag
/// is `(first << 8) | second`. Longer continuations (second byte with bit 8
/// set) are valid BER but unheard of on payment cards, so they're rejected.
///
/// See EMV Book 3, Annex B1: "Coding of the Tag Field of BER-TLV Data Objects".
pub fn take_tag(data: &[u8]) -> IResult<u16> {
    let (rest, first) = be_u8(data)?;
    if first & 0b0001_1111 != 0b0001_1111 {
        Ok((rest, first as u16))
    } else {
        let (rest, second) = be_u8(rest)?;
        if second & (1 << 7) != 0 {
            Err(nom::Err::Error(nom::error::Error::new(
                data, // Return the full input!
                nom::error::ErrorKind::TooLarge,
            )))
        } else {
            Ok((rest, (first as u16) << 8 | second as u16))
        }
    }
}

/// Parses a length field.
///
/// Short form is a single byte below 0x80. Long form is `0x80|n`, followed by
/// n big-endian length bytes; EMV caps n at 4. Indeterminate lengths
/// (`0b1000_0000`) are technically valid BER according to ISO 8825, but not
/// allowed in ISO 7816 or EMV.
pub fn take_len(data_: &[u8]) -> IResult<usize> {
    let (data, lenlen) = be_u8(data_)?;
    if lenlen <= 127 {
        Ok((data, lenlen as usize))
    } else {
        let lensize = (lenlen & 0b0111_1111) as usize;
        if lensize < 1 || lensize > 4 {
            Err(nom::Err::Error(nom::error::Error::new(
                data_, // Return the full input!
                nom::error::ErrorKind::TooLarge,
            )))
        } else {
            let (data, lenbytes) = take(lensize)(data)?;
            Ok((data, BigEndian::read_uint(lenbytes, lensize) as usize))
        }
    }
}

/// Decodes a BER-TLV blob as far as it will go.
///
/// Never fails: structural problems end the walk and are reported in the
/// returned [`Summary`] instead. Sibling order follows input order, and the
/// same input always produces the same output.
pub fn decode(data: &[u8]) -> (Vec<Node<'_>>, Summary) {
    let mut stop = None;
    let (nodes, remaining) = walk(data, 0, &mut stop);
    (
        nodes,
        Summary {
            consumed: data.len() - remaining,
            remaining,
            stop,
        },
    )
}

/// One level of the walk. Returns the nodes plus how many trailing bytes at
/// this level went unconsumed.
fn walk<'a>(mut data: &'a [u8], depth: usize, stop: &mut Option<Stop>) -> (Vec<Node<'a>>, usize) {
    let mut nodes = Vec::new();
    while !data.is_empty() {
        let (rest, tag) = match take_tag(data) {
            Ok(v) => v,
            Err(nom::Err::Error(e)) if e.code == nom::error::ErrorKind::TooLarge => {
                stop.get_or_insert(Stop::OversizeTag);
                return (nodes, data.len());
            }
            Err(_) => {
                stop.get_or_insert(Stop::TruncatedHeader);
                return (nodes, data.len());
            }
        };
        let (rest, len) = match take_len(rest) {
            Ok(v) => v,
            Err(nom::Err::Error(e)) if e.code == nom::error::ErrorKind::TooLarge => {
                stop.get_or_insert(Stop::UnsupportedLength);
                return (nodes, data.len());
            }
            Err(_) => {
                stop.get_or_insert(Stop::TruncatedHeader);
                return (nodes, data.len());
            }
        };

        if len == 0 && is_constructed(tag) {
            stop.get_or_insert(Stop::ZeroLengthConstructed);
            return (nodes, data.len());
        }

        // A length past the end of the slice is clamped, the node is emitted
        // with whatever bytes actually arrived, and the walk ends there.
        let clamped = len > rest.len();
        let take_n = if clamped { rest.len() } else { len };
        let (value, rest) = rest.split_at(take_n);

        let node = if is_constructed(tag) && TEMPLATES.contains(&tag) {
            if depth + 1 >= MAX_DEPTH {
                stop.get_or_insert(Stop::DepthLimit);
                Node {
                    tag,
                    value: Value::Primitive(value),
                }
            } else {
                let (children, _) = walk(value, depth + 1, stop);
                Node {
                    tag,
                    value: Value::Constructed(children),
                }
            }
        } else {
            Node {
                tag,
                value: Value::Primitive(value),
            }
        };
        nodes.push(node);

        if clamped {
            stop.get_or_insert(Stop::LengthClamped);
            return (nodes, 0);
        }
        data = rest;
    }
    (nodes, 0)
}

/// Depth-first pre-order search for every primitive value with the given tag.
pub fn find_all<'a>(nodes: &[Node<'a>], tag: u16) -> Vec<&'a [u8]> {
    let mut found = Vec::new();
    collect(nodes, tag, &mut found);
    found
}

fn collect<'a>(nodes: &[Node<'a>], tag: u16, found: &mut Vec<&'a [u8]>) {
    for node in nodes {
        match &node.value {
            Value::Primitive(v) => {
                if node.tag == tag {
                    found.push(v);
                }
            }
            Value::Constructed(children) => collect(children, tag, found),
        }
    }
}

/// The first primitive value with the given tag, if any.
pub fn find_first<'a>(nodes: &[Node<'a>], tag: u16) -> Option<&'a [u8]> {
    find_all(nodes, tag).into_iter().next()
}

/// Re-encodes a node tree. Lengths are normalized: short form when the value
/// fits in 127 bytes, minimal long form otherwise.
pub fn encode(nodes: &[Node<'_>]) -> Vec<u8> {
    let mut out = Vec::new();
    for node in nodes {
        let body = match &node.value {
            Value::Primitive(v) => v.to_vec(),
            Value::Constructed(children) => encode(children),
        };
        if node.tag > 0xFF {
            out.push((node.tag >> 8) as u8);
        }
        out.push(node.tag as u8);
        write_len(&mut out, body.len());
        out.extend_from_slice(&body);
    }
    out
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    if len <= 127 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}
