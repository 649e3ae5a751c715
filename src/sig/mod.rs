// decoder for the FLIRT .sig binary format.
//
// the format is undocumented; the layout here follows what radare2's
// flirt.c and the public format notes describe. the header's fixed
// scalars are little-endian, while the body uses big-endian
// variable-length integers, with two big-endian stragglers in the v8+
// header. the body is a trie of byte patterns; each leaf carries one or
// more crc groups of modules, chained by a per-module flags byte.

use std::borrow::Cow;

use bitflags::bitflags;
use log::{debug, trace};
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8, le_u16, le_u32, le_u8};
use nom::IResult;
use thiserror::Error;

use anyhow::Result;

use crate::{
    ByteSignature, HeaderExtra, Module, PublicFunction, ReferencedFunction, SigElement, SigFile,
    SigHeader, TailByte,
};

const MAGIC: &[u8] = b"IDASGN";

/// longest accepted function name, public or referenced.
const NAME_MAX: usize = 1024;

/// longest accepted pattern node.
const MAX_NODE_LENGTH: u8 = 63;

/// deepest accepted trie nesting; adversarial inputs must not be able to
/// exhaust the call stack.
const MAX_TREE_DEPTH: usize = 1024;

/// byte offset of the features field's low byte within the header.
const FEATURES_OFFSET: usize = 16;

#[derive(Debug, Error)]
pub enum SigError {
    #[error("File too short")]
    TooShort,
    #[error("Invalid magic (not IDASGN)")]
    BadMagic,
    #[error("Unsupported FLIRT version {0}")]
    UnsupportedVersion(u8),
    #[error("Truncated {0} header")]
    TruncatedHeader(&'static str),
    #[error("Truncated library name")]
    TruncatedLibraryName,
    #[error("Unexpected EOF in tree")]
    UnexpectedEof,
    #[error("Bad node length {0}")]
    BadNodeLength(u8),
    #[error("Function name too long")]
    NameTooLong,
    #[error("Signature tree too deep")]
    TreeTooDeep,
    #[error("Parse error in signature tree")]
    Corrupt,
    #[error("FLIRT decompression failed")]
    DecompressionFailed,
    #[error("Compressed .sig requires zlib")]
    ZlibUnavailable,
    #[error("Not a gzip stream")]
    NotGzip,
}

// every anonymous nom failure in this grammar is an out-of-input read,
// so the default conversion reports EOF; structural rejections are
// raised explicitly as nom::Err::Failure.
impl<'a> nom::error::ParseError<&'a [u8]> for SigError {
    fn from_error_kind(_input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        match kind {
            nom::error::ErrorKind::Eof => SigError::UnexpectedEof,
            _ => SigError::Corrupt,
        }
    }

    fn append(_input: &'a [u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

type SResult<'a, O> = IResult<&'a [u8], O, SigError>;

fn sig_error(e: nom::Err<SigError>) -> SigError {
    match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => SigError::UnexpectedEof,
    }
}

bitflags! {
    struct Features: u16 {
        const STARTUP = 0b00000001;
        const CTYPE_CRC = 0b00000010;
        const TWO_BYTE_CTYPE = 0b00000100;
        const ALT_CTYPE_CRC = 0b00001000;
        const COMPRESSED = 0b00010000;
        const CTYPE_CRC_3V = 0b00100000;
    }
}

bitflags! {
    struct ParsingFlags: u8 {
        const MORE_PUBLIC_NAMES = 0b00000001;
        const TAIL_BYTES = 0b00000010;
        const REFERENCED_FUNCTIONS = 0b00000100;
        const MORE_MODULES_WITH_SAME_CRC = 0b00001000;
        const MORE_MODULES = 0b00010000;
    }
}

bitflags! {
    struct FunctionAttributes: u8 {
        const LOCAL = 0b00000010;
        const UNRESOLVED_COLLISION = 0b00001000;
    }
}

/// decode bytes as Latin-1: one byte, one char.
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// unpack a variable-length integer with max range 16 bits.
fn vint16(input: &[u8]) -> SResult<u16> {
    let (input, high) = be_u8(input)?;
    let high = high as u16;

    if (high & 0x80) != 0x80 {
        return Ok((input, high));
    }

    let (input, low) = be_u8(input)?;
    Ok((input, ((high & 0x7f) << 8) | low as u16))
}

/// unpack a variable-length integer with max range 32 bits.
fn vint32(input: &[u8]) -> SResult<u32> {
    let (input, b) = be_u8(input)?;
    let b = b as u32;

    if (b & 0x80) != 0x80 {
        return Ok((input, b));
    }

    if (b & 0xc0) != 0xc0 {
        let (input, low) = be_u8(input)?;
        return Ok((input, ((b & 0x7f) << 8) | low as u32));
    }

    if (b & 0xe0) != 0xe0 {
        let (input, mid) = be_u8(input)?;
        let (input, low) = be_u16(input)?;
        return Ok((input, ((b & 0x3f) << 24) | ((mid as u32) << 16) | low as u32));
    }

    let (input, value) = be_u32(input)?;
    Ok((input, value))
}

/// unpack a module-body integer: offsets and lengths widen from 16 to 32
/// bits starting with version 9.
fn vword<'a>(input: &'a [u8], header: &SigHeader) -> SResult<'a, u32> {
    if header.version >= 9 {
        vint32(input)
    } else {
        let (input, v) = vint16(input)?;
        Ok((input, v as u32))
    }
}

/// read the wildcard mask for a pattern node of the given length.
///
/// the encoded width depends on the node length; callers enforce
/// `1 <= length <= 63` first. a set bit marks its position as a variant.
fn variant_mask(input: &[u8], length: u8) -> SResult<u64> {
    if length < 0x10 {
        let (input, v) = vint16(input)?;
        Ok((input, v as u64))
    } else if length <= 0x20 {
        let (input, v) = vint32(input)?;
        Ok((input, v as u64))
    } else {
        let (input, high) = vint32(input)?;
        let (input, low) = vint32(input)?;
        Ok((input, ((high as u64) << 32) | low as u64))
    }
}

/// the fixed 30-byte field block shared by all versions, directly after
/// magic and version. all scalars are little-endian.
fn v5_fixed(input: &[u8], version: u8) -> SResult<SigHeader> {
    let (input, arch) = le_u8(input)?;
    let (input, file_types) = le_u32(input)?;
    let (input, os_types) = le_u16(input)?;
    let (input, app_types) = le_u16(input)?;
    let (input, features) = le_u16(input)?;
    let (input, old_n_functions) = le_u16(input)?;
    let (input, crc16) = le_u16(input)?;
    let (input, ctype_bytes) = take(12usize)(input)?;
    let (input, library_name_length) = le_u8(input)?;
    let (input, ctypes_crc16) = le_u16(input)?;

    let mut ctype = [0u8; 12];
    ctype.copy_from_slice(ctype_bytes);

    Ok((
        input,
        SigHeader {
            version,
            arch,
            file_types,
            os_types,
            app_types,
            features,
            old_n_functions,
            crc16,
            ctype,
            library_name_length,
            ctypes_crc16,
            extra: HeaderExtra::V5,
            library_name: String::new(),
        },
    ))
}

fn header_extra(input: &[u8], version: u8) -> Result<(&[u8], HeaderExtra), SigError> {
    if version < 6 {
        return Ok((input, HeaderExtra::V5));
    }

    let (input, functions_count) =
        le_u32::<_, SigError>(input).map_err(|_| SigError::TruncatedHeader("v6/v7"))?;
    if version < 8 {
        return Ok((input, HeaderExtra::V6_7 { functions_count }));
    }

    // the pattern size and the v10 field are big-endian, unlike the rest
    // of the fixed header.
    let (input, pattern_size) =
        be_u16::<_, SigError>(input).map_err(|_| SigError::TruncatedHeader("v8/v9"))?;
    if version < 10 {
        return Ok((
            input,
            HeaderExtra::V8_9 {
                functions_count,
                pattern_size,
            },
        ));
    }

    let (input, unknown) =
        be_u16::<_, SigError>(input).map_err(|_| SigError::TruncatedHeader("v10"))?;
    Ok((
        input,
        HeaderExtra::V10 {
            functions_count,
            pattern_size,
            unknown,
        },
    ))
}

fn header(input: &[u8]) -> Result<(&[u8], SigHeader), SigError> {
    if input.len() < 7 {
        return Err(SigError::TooShort);
    }
    if &input[..6] != MAGIC {
        return Err(SigError::BadMagic);
    }
    let version = input[6];
    if !(5..=10).contains(&version) {
        return Err(SigError::UnsupportedVersion(version));
    }

    let (input, mut header) =
        v5_fixed(&input[7..], version).map_err(|_| SigError::TruncatedHeader("v5"))?;

    let (input, extra) = header_extra(input, version)?;
    header.extra = extra;

    let name_length = header.library_name_length as usize;
    if input.len() < name_length {
        return Err(SigError::TruncatedLibraryName);
    }
    header.library_name = latin1(&input[..name_length]);

    debug!("header: {:x?}", header);
    Ok((&input[name_length..], header))
}

/// read one pattern node: length, wildcard mask, then the literal bytes
/// of the non-wildcard positions. the mask's most significant bit
/// addresses byte index 0.
fn pattern_node(input: &[u8]) -> SResult<ByteSignature> {
    let (input, length) = be_u8(input)?;
    if length == 0 || length > MAX_NODE_LENGTH {
        return Err(nom::Err::Failure(SigError::BadNodeLength(length)));
    }

    let (input, mask) = variant_mask(input, length)?;
    trace!("node length {:#x} mask {:#x}", length, mask);

    let mut elements = Vec::with_capacity(length as usize);
    let mut input = input;
    for i in 0..length {
        if mask & (1u64 << (length - 1 - i)) != 0 {
            elements.push(SigElement::Wildcard);
        } else {
            let (rest, b) = be_u8(input)?;
            input = rest;
            elements.push(SigElement::Byte(b));
        }
    }

    Ok((input, ByteSignature(elements)))
}

fn public_function<'a>(
    input: &'a [u8],
    header: &SigHeader,
    base_offset: u32,
) -> SResult<'a, (PublicFunction, ParsingFlags)> {
    let (input, delta) = vword(input, header)?;
    let offset = base_offset.wrapping_add(delta);

    let (input, b) = be_u8(input)?;

    // a byte below the printable threshold here is a per-function
    // attribute byte, not the start of the name.
    let (mut input, mut b, attributes) = if b < 0x20 {
        let attributes = FunctionAttributes::from_bits_truncate(b);
        let (input, b) = be_u8(input)?;
        (input, b, attributes)
    } else {
        (input, b, FunctionAttributes::empty())
    };

    let mut name = Vec::new();
    while b >= 0x20 {
        name.push(b);
        if name.len() >= NAME_MAX {
            return Err(nom::Err::Failure(SigError::NameTooLong));
        }
        let (rest, next) = be_u8(input)?;
        input = rest;
        b = next;
    }

    // the byte that terminated the name doubles as the module's parsing
    // flags.
    let flags = ParsingFlags::from_bits_truncate(b);

    let function = PublicFunction {
        offset,
        name: latin1(&name),
        local: attributes.contains(FunctionAttributes::LOCAL),
        collision: attributes.contains(FunctionAttributes::UNRESOLVED_COLLISION),
    };
    trace!("function: {:x?}", function);

    Ok((input, (function, flags)))
}

fn tail_bytes<'a>(input: &'a [u8], header: &SigHeader) -> SResult<'a, Vec<TailByte>> {
    let (mut input, count) = if header.version >= 8 {
        be_u8(input)?
    } else {
        (input, 1)
    };

    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, offset) = vword(input, header)?;
        let (rest, value) = be_u8(rest)?;
        input = rest;
        out.push(TailByte { offset, value });
    }

    Ok((input, out))
}

fn referenced_functions<'a>(
    input: &'a [u8],
    header: &SigHeader,
) -> SResult<'a, Vec<ReferencedFunction>> {
    let (mut input, count) = if header.version >= 8 {
        be_u8(input)?
    } else {
        (input, 1)
    };

    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, offset) = vword(input, header)?;

        // a zero length byte is an escape: the real length follows as a
        // multi-byte integer.
        let (rest, short_length) = be_u8(rest)?;
        let (rest, name_length) = if short_length == 0 {
            vint32(rest)?
        } else {
            (rest, short_length as u32)
        };
        if name_length as usize >= NAME_MAX {
            return Err(nom::Err::Failure(SigError::NameTooLong));
        }

        let (rest, name_bytes) = take(name_length as usize)(rest)?;

        // a trailing NUL marks the offset as negative.
        let (name_bytes, negative_offset) = match name_bytes.split_last() {
            Some((&0, head)) => (head, true),
            _ => (name_bytes, false),
        };

        input = rest;
        out.push(ReferencedFunction {
            offset,
            name: latin1(name_bytes),
            negative_offset,
        });
    }

    Ok((input, out))
}

/// decode the modules at a leaf: one or more crc groups, each holding
/// one or more modules that share the crc, chained by the flags byte
/// that terminates each module's last function name.
fn leaf<'a>(
    input: &'a [u8],
    header: &SigHeader,
    path: &[ByteSignature],
    modules: &mut Vec<Module>,
) -> SResult<'a, ()> {
    let mut input = input;
    loop {
        let (rest, crc_length) = be_u8(input)?;
        let (rest, crc16) = be_u16(rest)?;
        input = rest;
        debug!("crc group: length={:#04x} value={:#06x}", crc_length, crc16);

        let group_flags = loop {
            let (rest, length) = vword(input, header)?;
            input = rest;

            let mut public_functions = Vec::new();
            let mut offset = 0u32;
            let flags = loop {
                let (rest, (function, flags)) = public_function(input, header, offset)?;
                input = rest;
                offset = function.offset;
                public_functions.push(function);
                if !flags.contains(ParsingFlags::MORE_PUBLIC_NAMES) {
                    break flags;
                }
            };

            let (rest, tail) = if flags.contains(ParsingFlags::TAIL_BYTES) {
                tail_bytes(input, header)?
            } else {
                (input, Vec::new())
            };
            input = rest;

            let (rest, references) = if flags.contains(ParsingFlags::REFERENCED_FUNCTIONS) {
                referenced_functions(input, header)?
            } else {
                (input, Vec::new())
            };
            input = rest;

            modules.push(Module {
                pattern_path: path.to_vec(),
                crc_length,
                crc16,
                length,
                public_functions,
                tail_bytes: tail,
                referenced_functions: references,
            });

            if !flags.contains(ParsingFlags::MORE_MODULES_WITH_SAME_CRC) {
                break flags;
            }
        };

        if !group_flags.contains(ParsingFlags::MORE_MODULES) {
            break;
        }
    }

    Ok((input, ()))
}

/// walk one subtree: a child count, then per child a pattern node and
/// its subtree. a child count of zero marks a leaf.
fn tree<'a>(
    input: &'a [u8],
    header: &SigHeader,
    path: &mut Vec<ByteSignature>,
    depth: usize,
    modules: &mut Vec<Module>,
) -> SResult<'a, ()> {
    let (input, tree_nodes) = vint32(input)?;

    if tree_nodes == 0 {
        return leaf(input, header, path, modules);
    }

    if depth >= MAX_TREE_DEPTH {
        return Err(nom::Err::Failure(SigError::TreeTooDeep));
    }

    let mut input = input;
    for _ in 0..tree_nodes {
        let (rest, node) = pattern_node(input)?;
        path.push(node);
        let (rest, ()) = tree(rest, header, path, depth + 1, modules)?;
        path.pop();
        input = rest;
    }

    Ok((input, ()))
}

#[cfg(feature = "zlib")]
fn inflate_body(input: &[u8], version: u8) -> Result<Vec<u8>, SigError> {
    use std::io::Read;

    // v5 and v6 bodies are raw deflate streams; later versions carry a
    // zlib wrapper.
    let mut body = Vec::new();
    let outcome = if version < 7 {
        flate2::read::DeflateDecoder::new(input).read_to_end(&mut body)
    } else {
        flate2::read::ZlibDecoder::new(input).read_to_end(&mut body)
    };

    match outcome {
        Ok(_) if !body.is_empty() => Ok(body),
        Ok(_) => Err(SigError::DecompressionFailed),
        Err(e) => {
            log::error!("inflate failed: {}", e);
            Err(SigError::DecompressionFailed)
        }
    }
}

#[cfg(not(feature = "zlib"))]
fn inflate_body(_input: &[u8], _version: u8) -> Result<Vec<u8>, SigError> {
    Err(SigError::ZlibUnavailable)
}

fn sig(input: &[u8]) -> Result<SigFile, SigError> {
    let (rest, header) = header(input)?;

    let body: Cow<[u8]> =
        if Features::from_bits_truncate(header.features).contains(Features::COMPRESSED) {
            Cow::Owned(inflate_body(rest, header.version)?)
        } else {
            Cow::Borrowed(rest)
        };

    let mut modules = Vec::new();
    let mut path = Vec::new();
    tree(body.as_ref(), &header, &mut path, 0, &mut modules).map_err(sig_error)?;
    debug!("parsed {} modules", modules.len());

    Ok(SigFile { header, modules })
}

/// parse a .sig file into its header and modules.
///
/// the input must be a raw signature blob starting with the `IDASGN`
/// magic; unwrap a gzip envelope with [`unwrap_gzip`] first.
pub fn parse(buf: &[u8]) -> Result<SigFile> {
    Ok(sig(buf)?)
}

/// sniff a buffer for the FLIRT magic, returning the version byte when
/// it looks like a supported .sig file.
pub fn sniff(buf: &[u8]) -> Option<u8> {
    if buf.len() < 7 || &buf[..6] != MAGIC {
        return None;
    }
    let version = buf[6];
    (5..=10).contains(&version).then_some(version)
}

/// unwrap a gzip envelope (.sig.gz) into the raw signature bytes.
#[cfg(feature = "zlib")]
pub fn unwrap_gzip(buf: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    if buf.len() < 2 || buf[0] != 0x1f || buf[1] != 0x8b {
        return Err(SigError::NotGzip.into());
    }

    let mut out = Vec::new();
    flate2::read::GzDecoder::new(buf)
        .read_to_end(&mut out)
        .map_err(|_| SigError::DecompressionFailed)?;
    Ok(out)
}

#[cfg(not(feature = "zlib"))]
pub fn unwrap_gzip(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 2 || buf[0] != 0x1f || buf[1] != 0x8b {
        return Err(SigError::NotGzip.into());
    }
    Err(SigError::ZlibUnavailable.into())
}

/// rewrite a .sig with a compressed body as an equivalent uncompressed
/// one. already-raw input passes through unchanged.
pub fn unpack(buf: &[u8]) -> Result<Vec<u8>> {
    let (rest, header) = header(buf)?;

    if !Features::from_bits_truncate(header.features).contains(Features::COMPRESSED) {
        return Ok(buf.to_vec());
    }

    let body = inflate_body(rest, header.version)?;
    let header_length = buf.len() - rest.len();

    let mut out = Vec::with_capacity(header_length + body.len());
    out.extend_from_slice(&buf[..header_length]);
    // clear the compressed bit so the output parses as a raw body.
    out[FEATURES_OFFSET] &= !(Features::COMPRESSED.bits() as u8);
    out.extend_from_slice(&body);
    Ok(out)
}
