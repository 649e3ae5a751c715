// FLIRT signature libraries (.sig files, magic `IDASGN`) package the
// fingerprints of the functions in a compiled library: a trie of byte
// patterns with wildcards, whose leaves carry modules with a CRC check,
// public function names, tail-byte disambiguators and referenced names.
//
// for example, dumpsig renders one module of a parsed msvc library as:
//
// ```text
//     558bec6aff68........64a100000000 0b dc99 0063 :0000 __EH_prolog (0032: 87)
// ```
//
// that is: the pattern path walked from the trie root (`..` marks a
// wildcard), the number of bytes covered by the crc16, the crc16 value,
// the module length, the public names, and any tail bytes.
//
// the decoder lives in [`sig`]; this module is the decoded model.

use std::fmt;

pub mod sig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigElement {
    Byte(u8),
    Wildcard,
}

impl fmt::Display for SigElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigElement::Byte(v) => write!(f, "{:02x}", v),
            SigElement::Wildcard => write!(f, ".."),
        }
    }
}

/// one pattern node of the signature trie: a fixed-width byte pattern in
/// which each position is either a concrete byte or a wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteSignature(pub Vec<SigElement>);

impl fmt::Display for ByteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for elem in self.0.iter() {
            write!(f, "{}", elem)?;
        }
        Ok(())
    }
}

/// an exported name in a module, at a known offset from module start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicFunction {
    pub offset: u32,
    pub name: String,
    /// the name is private to the module.
    pub local: bool,
    /// the name is one of several colliding candidates at this offset.
    pub collision: bool,
}

impl fmt::Display for PublicFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local {
            write!(f, ":{:04x}@ {}", self.offset, self.name)
        } else {
            write!(f, ":{:04x} {}", self.offset, self.name)
        }
    }
}

/// a single-byte equality check used to break crc16 ties between
/// otherwise identical modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailByte {
    pub offset: u32,
    pub value: u8,
}

impl fmt::Display for TailByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X}: {:02X})", self.offset, self.value)
    }
}

/// a name referenced from within the module body, e.g. a relocation
/// target, used as a secondary disambiguation signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedFunction {
    pub offset: u32,
    pub name: String,
    pub negative_offset: bool,
}

impl fmt::Display for ReferencedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.negative_offset { "-" } else { "" };
        write!(f, "^{}{:04x} {}", sign, self.offset, self.name)
    }
}

/// one library object file's fingerprint: the pattern path from the trie
/// root, a crc16 over the bytes past the pattern, the module length, and
/// the associated names and tail-byte checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// pattern nodes walked from the root to this module's leaf,
    /// excluding the empty root.
    pub pattern_path: Vec<ByteSignature>,
    /// number of bytes covered by the crc16, starting after the pattern.
    pub crc_length: u8,
    pub crc16: u16,
    /// total length of the module.
    pub length: u32,
    pub public_functions: Vec<PublicFunction>,
    pub tail_bytes: Vec<TailByte>,
    pub referenced_functions: Vec<ReferencedFunction>,
}

impl Module {
    /// render the pattern path as space-separated node patterns, like
    /// `55..8b 4508`.
    pub fn pattern_path_hex(&self) -> String {
        let parts: Vec<String> = self.pattern_path.iter().map(|n| n.to_string()).collect();
        parts.join(" ")
    }

    /// the module's primary name: the first public name at offset zero.
    pub fn get_name(&self) -> Option<&str> {
        self.public_functions
            .iter()
            .find(|f| f.offset == 0)
            .map(|f| f.name.as_str())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.pattern_path_hex())?;
        write!(f, "{:02x} ", self.crc_length)?;
        write!(f, "{:04x} ", self.crc16)?;
        write!(f, "{:04x}", self.length)?;

        for function in self.public_functions.iter() {
            write!(f, " {}", function)?;
        }

        for reference in self.referenced_functions.iter() {
            write!(f, " {}", reference)?;
        }

        for tail_byte in self.tail_bytes.iter() {
            write!(f, " {}", tail_byte)?;
        }

        Ok(())
    }
}

/// header fields that were appended to the format over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderExtra {
    V5,
    V6_7 {
        functions_count: u32,
    },
    V8_9 {
        functions_count: u32,
        pattern_size: u16,
    },
    V10 {
        functions_count: u32,
        pattern_size: u16,
        unknown: u16,
    },
}

impl HeaderExtra {
    pub fn functions_count(&self) -> Option<u32> {
        match self {
            HeaderExtra::V5 => None,
            HeaderExtra::V6_7 { functions_count }
            | HeaderExtra::V8_9 {
                functions_count, ..
            }
            | HeaderExtra::V10 {
                functions_count, ..
            } => Some(*functions_count),
        }
    }

    pub fn pattern_size(&self) -> Option<u16> {
        match self {
            HeaderExtra::V5 | HeaderExtra::V6_7 { .. } => None,
            HeaderExtra::V8_9 { pattern_size, .. } | HeaderExtra::V10 { pattern_size, .. } => {
                Some(*pattern_size)
            }
        }
    }
}

/// the .sig file header.
///
/// the bitfields (file types, os types, app types, features) are kept as
/// the raw integers found in the file; naming their bits is a display
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigHeader {
    pub version: u8,
    pub arch: u8,
    pub file_types: u32,
    pub os_types: u16,
    pub app_types: u16,
    pub features: u16,
    pub old_n_functions: u16,
    pub crc16: u16,
    /// 12-byte compiler type tag.
    pub ctype: [u8; 12],
    pub library_name_length: u8,
    pub ctypes_crc16: u16,
    pub extra: HeaderExtra,
    pub library_name: String,
}

/// a fully decoded .sig file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigFile {
    pub header: SigHeader,
    pub modules: Vec<Module>,
}

impl SigFile {
    /// flatten all public functions across modules, in module order,
    /// tagged with the owning module's index.
    pub fn functions(&self) -> impl Iterator<Item = (usize, &Module, &PublicFunction)> {
        self.modules.iter().enumerate().flat_map(|(index, module)| {
            module
                .public_functions
                .iter()
                .map(move |function| (index, module, function))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SigHeader {
        SigHeader {
            version: 9,
            arch: 0,
            file_types: 0x0800,
            os_types: 0x0002,
            app_types: 0x0004,
            features: 0,
            old_n_functions: 0,
            crc16: 0,
            ctype: [0; 12],
            library_name_length: 4,
            ctypes_crc16: 0,
            extra: HeaderExtra::V8_9 {
                functions_count: 3,
                pattern_size: 32,
            },
            library_name: "test".to_string(),
        }
    }

    fn module(names: &[&str]) -> Module {
        Module {
            pattern_path: vec![ByteSignature(vec![
                SigElement::Byte(0x55),
                SigElement::Wildcard,
                SigElement::Byte(0x8b),
            ])],
            crc_length: 2,
            crc16: 0xdc99,
            length: 0x63,
            public_functions: names
                .iter()
                .enumerate()
                .map(|(i, name)| PublicFunction {
                    offset: i as u32 * 0x10,
                    name: name.to_string(),
                    local: false,
                    collision: false,
                })
                .collect(),
            tail_bytes: vec![],
            referenced_functions: vec![],
        }
    }

    #[test]
    fn byte_signature_display() {
        let node = ByteSignature(vec![
            SigElement::Byte(0x55),
            SigElement::Wildcard,
            SigElement::Byte(0x8b),
        ]);
        assert_eq!(node.to_string(), "55..8b");
    }

    #[test]
    fn pattern_path_hex_joins_nodes() {
        let mut m = module(&["f"]);
        m.pattern_path
            .push(ByteSignature(vec![SigElement::Byte(0x90)]));
        assert_eq!(m.pattern_path_hex(), "55..8b 90");
    }

    #[test]
    fn module_display_is_pat_flavoured() {
        let mut m = module(&["__EH_prolog"]);
        m.tail_bytes.push(TailByte {
            offset: 0x32,
            value: 0x87,
        });
        assert_eq!(
            m.to_string(),
            "55..8b 02 dc99 0063 :0000 __EH_prolog (0032: 87)"
        );
    }

    #[test]
    fn get_name_picks_offset_zero() {
        let mut m = module(&["first", "second"]);
        assert_eq!(m.get_name(), Some("first"));
        m.public_functions[0].offset = 4;
        assert_eq!(m.get_name(), None);
    }

    #[test]
    fn functions_flattens_modules_in_order() {
        let file = SigFile {
            header: header(),
            modules: vec![module(&["a", "b"]), module(&["c"])],
        };

        let names: Vec<(usize, &str)> = file
            .functions()
            .map(|(index, _, function)| (index, function.name.as_str()))
            .collect();
        assert_eq!(names, vec![(0, "a"), (0, "b"), (1, "c")]);
    }
}
