use std::collections::{BTreeMap, HashMap};

use lopdf::{Dictionary, Document, Object};
use owned_ttf_parser::{AsFaceRef as _, Face, OwnedFace};

use crate::error::ContextError;

/// A font face loaded from a TTF font, together with its measure of units per em.
#[derive(Clone)]
pub struct TtfFontFace {
    /// The underlying font face which is represented through the `ttf_parser` crate.
    inner: std::sync::Arc<OwnedFace>,
    /// The number of units per em of the font face.
    units_per_em: u16,
}

impl std::fmt::Debug for TtfFontFace {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TtfFontFace")
            .field("units_per_em", &self.units_per_em)
            .field("glyph_count", &self.glyph_count())
            .finish()
    }
}

impl TtfFontFace {
    /// Constructs a font face from the underlying raw data extracted from the TTF font file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ContextError> {
        let face = OwnedFace::from_vec(data.to_vec(), 0)
            .map_err(|error| ContextError::with_error("Failed to parse font", &error))?;
        let units_per_em = face.as_face_ref().units_per_em();

        Ok(Self {
            inner: std::sync::Arc::new(face),
            units_per_em,
        })
    }

    /// The number of font units per em square.
    pub fn units_per_em(&self) -> u16 {
        self.units_per_em
    }

    /// The typographic ascender of the face, in font units.
    pub fn ascender(&self) -> i16 {
        self.face().ascender()
    }

    /// The typographic descender of the face, in font units (negative below the baseline).
    pub fn descender(&self) -> i16 {
        self.face().descender()
    }

    /// Retrieve the total number of glyphs present in the font face.
    pub fn glyph_count(&self) -> u16 {
        self.face().number_of_glyphs()
    }

    /// Retrieve the glyph ID of a specific codepoint, which in our case is just a `char`.
    pub fn glyph_id(&self, codepoint: char) -> Option<u16> {
        self.face()
            .glyph_index(codepoint)
            .map(|glyph_id| glyph_id.0)
    }

    /// The horizontal advance of a glyph in font units, when the font provides one.
    pub fn glyph_advance(&self, glyph_id: u16) -> Option<u16> {
        self.face()
            .glyph_hor_advance(owned_ttf_parser::GlyphId(glyph_id))
    }

    /// The horizontal advance of a glyph in thousandths of the em square, which is the
    /// unit the PDF text machinery works in.
    pub fn glyph_advance_in_thousandths(&self, glyph_id: u16) -> Option<f32> {
        self.glyph_advance(glyph_id)
            .map(|advance| advance as f32 * 1000.0 / self.units_per_em as f32)
    }

    /// Walk the outline of a glyph through the given builder. Returns `None` when the
    /// glyph has no outline in the font (which is the case for blank glyphs, but also
    /// for bitmap-only or CFF-only fonts).
    pub fn outline_glyph(
        &self,
        glyph_id: u16,
        builder: &mut dyn owned_ttf_parser::OutlineBuilder,
    ) -> Option<owned_ttf_parser::Rect> {
        self.face()
            .outline_glyph(owned_ttf_parser::GlyphId(glyph_id), builder)
    }

    /// Retrieve the mapping between the glyph IDs and the characters (codepoints), that
    /// specifically contains exactly the number of unicode glyphs present in the font.
    pub fn glyph_ids(&self) -> HashMap<u16, char> {
        let font_subtables = self.face().tables().cmap.map(|cmap| {
            cmap.subtables
                .into_iter()
                .filter(|font_subtable| font_subtable.is_unicode())
        });
        let Some(font_subtables) = font_subtables else {
            return HashMap::new();
        };

        let mut gid_to_codepoint_map =
            HashMap::with_capacity(self.face().number_of_glyphs().into());
        for font_subtable in font_subtables {
            font_subtable.codepoints(|codepoint| {
                if let Ok(character) = char::try_from(codepoint) {
                    if let Some(glyph_index) = font_subtable
                        .glyph_index(codepoint)
                        .filter(|index| index.0 > 0)
                    {
                        gid_to_codepoint_map
                            .entry(glyph_index.0)
                            .or_insert(character);
                    }
                }
            })
        }

        gid_to_codepoint_map
    }

    /// Retrieve the underlying font face as a reference.
    fn face(&self) -> &Face<'_> {
        self.inner.as_face_ref()
    }
}

/// How the show-string bytes of a font are grouped into character codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLayout {
    /// Two-byte codes, the shape of Type0 fonts with the Identity-H encoding. The code
    /// doubles as the CID.
    TwoByte,
    /// Single-byte codes, the shape of simple TrueType and Type1 fonts.
    OneByte,
}

/// One character code decoded out of a show-string, together with everything the
/// extraction and stripping passes need to know about it.
#[derive(Debug, Clone)]
pub struct DecodedGlyph {
    /// The raw character code as it appears in the content stream.
    pub code: u32,
    /// The glyph index inside the embedded font program, when one could be resolved.
    pub glyph_id: Option<u16>,
    /// The Unicode text this code stands for, empty when the font gives no mapping.
    pub text: String,
    /// The horizontal advance in thousandths of the text space unit.
    pub advance: f32,
    /// Whether the code is the single-byte code 32, to which PDF word spacing applies.
    pub is_word_boundary: bool,
}

/// A font referenced by a page of the source document, parsed just deeply enough to
/// decode its show-strings, measure their advances and outline their glyphs. This is
/// deliberately not a full font implementation: everything here leans on `lopdf` for
/// the PDF structure and on `ttf_parser` for the font program.
#[derive(Debug, Clone)]
pub struct PageFont {
    /// The resource name under which the page refers to this font, such as `F1`.
    pub resource_name: Vec<u8>,
    /// The value of the font's `BaseFont` entry, for diagnostics.
    pub base_font: String,
    /// How show-string bytes group into codes.
    pub code_layout: CodeLayout,
    /// The ToUnicode mapping from character codes to text, when the font carries one.
    to_unicode: Option<HashMap<u32, String>>,
    /// Per-code advance widths in thousandths, from the `W` array of CID fonts or the
    /// `Widths` array of simple fonts.
    widths: HashMap<u32, f32>,
    /// The advance used for codes missing from `widths` (the `DW` entry, or 1000).
    default_width: f32,
    /// The embedded TrueType program, when the font carries a `FontFile2` stream.
    face: Option<TtfFontFace>,
    /// Whether the CID-to-glyph mapping is the identity (the only supported layout).
    identity_cid_to_gid: bool,
}

impl PageFont {
    /// Parse a font out of its PDF dictionary. Unsupported font flavors still produce a
    /// usable `PageFont` (decoding falls back to defaults), because the stripping pass
    /// must see every show-string even when it cannot do much with it.
    pub fn from_dictionary(
        document: &Document,
        resource_name: Vec<u8>,
        font_dictionary: &Dictionary,
    ) -> Result<Self, ContextError> {
        let subtype = font_dictionary
            .get(b"Subtype")
            .and_then(Object::as_name)
            .map(|name| name.to_vec())
            .unwrap_or_default();

        let base_font = font_dictionary
            .get(b"BaseFont")
            .and_then(Object::as_name)
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_else(|_| String::from("unknown"));

        let to_unicode = parse_to_unicode(document, font_dictionary)?;

        if subtype == b"Type0" {
            Self::from_type0_dictionary(
                document,
                resource_name,
                base_font,
                font_dictionary,
                to_unicode,
            )
        } else {
            Self::from_simple_dictionary(
                document,
                resource_name,
                base_font,
                font_dictionary,
                to_unicode,
            )
        }
    }

    fn from_type0_dictionary(
        document: &Document,
        resource_name: Vec<u8>,
        base_font: String,
        font_dictionary: &Dictionary,
        to_unicode: Option<HashMap<u32, String>>,
    ) -> Result<Self, ContextError> {
        // The only composite encoding this tool understands is Identity-H, which is
        // what OCR generators emit. Anything else still decodes as two-byte codes,
        // just with a warning.
        if let Ok(encoding) = font_dictionary.get(b"Encoding").and_then(Object::as_name) {
            if encoding != b"Identity-H" {
                log::warn!(
                    "The font {:?} uses the unsupported encoding {:?}, treating it as Identity-H",
                    base_font,
                    String::from_utf8_lossy(encoding)
                );
            }
        }

        // The actual metrics live in the single descendant CIDFont dictionary.
        let descendant = font_dictionary
            .get(b"DescendantFonts")
            .map(|object| resolve(document, object))
            .ok()
            .and_then(|object| object.as_array().ok())
            .and_then(|descendants| descendants.first())
            .map(|object| resolve(document, object))
            .and_then(|object| object.as_dict().ok())
            .ok_or(ContextError::with_context(format!(
                "The Type0 font {:?} has no descendant font dictionary",
                base_font
            )))?;

        let default_width = descendant
            .get(b"DW")
            .ok()
            .and_then(object_to_f32)
            .unwrap_or(1000.0);

        let mut widths = HashMap::new();
        if let Ok(w_array) = descendant.get(b"W").map(|object| resolve(document, object)) {
            if let Ok(w_array) = w_array.as_array() {
                parse_cid_widths(document, w_array, &mut widths);
            }
        }

        let identity_cid_to_gid = match descendant
            .get(b"CIDToGIDMap")
            .map(|object| resolve(document, object))
        {
            Ok(Object::Name(name)) if name != b"Identity" => {
                log::warn!(
                    "The font {:?} has the CIDToGIDMap {:?}, only Identity is supported",
                    base_font,
                    String::from_utf8_lossy(name)
                );
                false
            }
            Ok(Object::Stream(_)) => {
                log::warn!(
                    "The font {:?} has a stream CIDToGIDMap, only Identity is supported",
                    base_font
                );
                false
            }
            _ => true,
        };

        let face = parse_embedded_face(document, descendant, &base_font);

        Ok(PageFont {
            resource_name,
            base_font,
            code_layout: CodeLayout::TwoByte,
            to_unicode,
            widths,
            default_width,
            face,
            identity_cid_to_gid,
        })
    }

    fn from_simple_dictionary(
        document: &Document,
        resource_name: Vec<u8>,
        base_font: String,
        font_dictionary: &Dictionary,
        to_unicode: Option<HashMap<u32, String>>,
    ) -> Result<Self, ContextError> {
        let first_char = font_dictionary
            .get(b"FirstChar")
            .and_then(Object::as_i64)
            .unwrap_or(0) as u32;

        let mut widths = HashMap::new();
        if let Ok(widths_array) = font_dictionary
            .get(b"Widths")
            .map(|object| resolve(document, object))
        {
            if let Ok(widths_array) = widths_array.as_array() {
                for (offset, width) in widths_array.iter().enumerate() {
                    if let Some(width) = object_to_f32(resolve(document, width)) {
                        widths.insert(first_char + offset as u32, width);
                    }
                }
            }
        }

        let face = parse_embedded_face(document, font_dictionary, &base_font);

        Ok(PageFont {
            resource_name,
            base_font,
            code_layout: CodeLayout::OneByte,
            to_unicode,
            widths,
            default_width: 500.0,
            face,
            identity_cid_to_gid: false,
        })
    }

    /// The embedded TrueType face of the font, when one is available.
    pub fn face(&self) -> Option<&TtfFontFace> {
        self.face.as_ref()
    }

    /// Whether the stripping pass can turn this font's glyphs into outlines.
    pub fn can_outline(&self) -> bool {
        self.face.is_some()
            && (self.code_layout == CodeLayout::OneByte || self.identity_cid_to_gid)
    }

    /// Decode the bytes of a show-string into per-code glyph records.
    pub fn decode_show_string(&self, bytes: &[u8]) -> Vec<DecodedGlyph> {
        match self.code_layout {
            CodeLayout::TwoByte => bytes
                .chunks(2)
                .map(|chunk| {
                    // A trailing odd byte is malformed input, pad it as the low byte.
                    let code = match chunk {
                        [high, low] => u32::from(u16::from_be_bytes([*high, *low])),
                        [single] => u32::from(*single),
                        _ => 0,
                    };
                    self.decode_code(code, false)
                })
                .collect(),
            CodeLayout::OneByte => bytes
                .iter()
                .map(|&byte| self.decode_code(u32::from(byte), byte == b' '))
                .collect(),
        }
    }

    fn decode_code(&self, code: u32, is_word_boundary: bool) -> DecodedGlyph {
        let text = self
            .to_unicode
            .as_ref()
            .and_then(|map| map.get(&code))
            .cloned()
            .unwrap_or_else(|| self.fallback_text(code));

        let glyph_id = self.glyph_id_for_code(code, &text);

        let advance = self.widths.get(&code).copied().or_else(|| {
            // Fonts without explicit widths still carry usable metrics in the
            // embedded program itself.
            glyph_id
                .and_then(|glyph_id| self.face.as_ref()?.glyph_advance_in_thousandths(glyph_id))
        });

        DecodedGlyph {
            code,
            glyph_id,
            text,
            advance: advance.unwrap_or(self.default_width),
            is_word_boundary,
        }
    }

    fn fallback_text(&self, code: u32) -> String {
        match self.code_layout {
            // Without a ToUnicode map a CID is opaque; the caller decides what to do
            // with an empty decoding.
            CodeLayout::TwoByte => String::new(),
            // Treating the byte as Latin-1 matches what viewers do for unencoded
            // simple fonts, and it is right for the Standard/WinAnsi printable range.
            CodeLayout::OneByte => char::from_u32(code)
                .map(|character| character.to_string())
                .unwrap_or_default(),
        }
    }

    /// Build a font out of thin air for the unit tests of this crate, which must be
    /// able to exercise the interpreter without fixture files.
    #[cfg(test)]
    pub(crate) fn synthetic_for_tests(
        resource_name: Vec<u8>,
        code_layout: CodeLayout,
        to_unicode: Option<HashMap<u32, String>>,
        widths: HashMap<u32, f32>,
        default_width: f32,
    ) -> PageFont {
        PageFont {
            resource_name,
            base_font: "Synthetic".into(),
            code_layout,
            to_unicode,
            widths,
            default_width,
            face: None,
            identity_cid_to_gid: code_layout == CodeLayout::TwoByte,
        }
    }

    fn glyph_id_for_code(&self, code: u32, text: &str) -> Option<u16> {
        match self.code_layout {
            CodeLayout::TwoByte => {
                if self.identity_cid_to_gid {
                    u16::try_from(code).ok()
                } else {
                    None
                }
            }
            CodeLayout::OneByte => {
                let face = self.face.as_ref()?;
                let character = text.chars().next()?;
                face.glyph_id(character)
            }
        }
    }
}

/// Parse all the fonts referenced by a page, keyed by their resource names.
pub fn collect_page_fonts(
    document: &Document,
    page_id: lopdf::ObjectId,
) -> BTreeMap<Vec<u8>, PageFont> {
    let mut fonts = BTreeMap::new();
    for (resource_name, font_dictionary) in document.get_page_fonts(page_id) {
        match PageFont::from_dictionary(document, resource_name.clone(), font_dictionary) {
            Ok(font) => {
                log::debug!(
                    "Parsed the font {:?} ({:?}, outline available: {})",
                    String::from_utf8_lossy(&resource_name),
                    font.base_font,
                    font.can_outline()
                );
                fonts.insert(resource_name, font);
            }
            Err(error) => {
                log::warn!(
                    "Skipping the font {:?}: {}",
                    String::from_utf8_lossy(&resource_name),
                    error
                );
            }
        }
    }

    fonts
}

/// Follow reference objects until an actual value is reached.
pub fn resolve<'a>(document: &'a Document, mut object: &'a Object) -> &'a Object {
    // A reference chain longer than a few hops means a broken document; bail out
    // instead of looping forever.
    for _ in 0..16 {
        match object {
            Object::Reference(id) => match document.get_object(*id) {
                Ok(referenced) => object = referenced,
                Err(_) => return object,
            },
            _ => return object,
        }
    }
    object
}

/// Extract a numeric value out of a PDF object, which stores integers and reals as
/// distinct variants.
pub fn object_to_f32(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value),
        _ => None,
    }
}

/// Load the TrueType program embedded in a font's descriptor, when there is one.
/// Failures are logged and swallowed: a font without a usable program still decodes
/// its show-strings, it only cannot be outlined.
fn parse_embedded_face(
    document: &Document,
    font_dictionary: &Dictionary,
    base_font: &str,
) -> Option<TtfFontFace> {
    let descriptor = font_dictionary
        .get(b"FontDescriptor")
        .map(|object| resolve(document, object))
        .ok()?
        .as_dict()
        .ok()?;

    let Object::Stream(stream) = descriptor
        .get(b"FontFile2")
        .map(|object| resolve(document, object))
        .ok()?
    else {
        // FontFile (Type1) and FontFile3 (CFF) programs are not outlined here.
        log::debug!(
            "The font {:?} embeds no TrueType program, its glyphs cannot be outlined",
            base_font
        );
        return None;
    };

    let data = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());
    match TtfFontFace::from_bytes(&data) {
        Ok(face) => Some(face),
        Err(error) => {
            log::warn!(
                "Unable to parse the embedded font program of {:?}: {}",
                base_font,
                error
            );
            None
        }
    }
}

/// Parse the `W` array of a CID font, which interleaves two forms: `c [w1 w2 ...]`
/// assigns consecutive widths starting at CID `c`, while `c1 c2 w` assigns the width
/// `w` to the whole CID range.
fn parse_cid_widths(document: &Document, w_array: &[Object], widths: &mut HashMap<u32, f32>) {
    let mut index = 0;
    while index < w_array.len() {
        let Some(first) = object_to_f32(resolve(document, &w_array[index])) else {
            break;
        };
        let first = first as u32;

        match w_array.get(index + 1).map(|object| resolve(document, object)) {
            Some(Object::Array(consecutive)) => {
                for (offset, width) in consecutive.iter().enumerate() {
                    if let Some(width) = object_to_f32(resolve(document, width)) {
                        widths.insert(first + offset as u32, width);
                    }
                }
                index += 2;
            }
            Some(other) => {
                let Some(last) = object_to_f32(other) else {
                    break;
                };
                let Some(width) = w_array
                    .get(index + 2)
                    .and_then(|object| object_to_f32(resolve(document, object)))
                else {
                    break;
                };
                for code in first..=(last as u32) {
                    widths.insert(code, width);
                }
                index += 3;
            }
            None => break,
        }
    }
}

/// Parse the ToUnicode CMap of a font into a mapping from character codes to text.
fn parse_to_unicode(
    document: &Document,
    font_dictionary: &Dictionary,
) -> Result<Option<HashMap<u32, String>>, ContextError> {
    let Ok(to_unicode) = font_dictionary
        .get(b"ToUnicode")
        .map(|object| resolve(document, object))
    else {
        return Ok(None);
    };

    let Object::Stream(stream) = to_unicode else {
        // A name like /Identity-H carries no mapping we could use.
        return Ok(None);
    };

    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());
    let cmap = adobe_cmap_parser::get_unicode_map(&content)
        .map_err(|_| ContextError::with_context("Unable to parse a ToUnicode CMap"))?;

    let mut unicode_map = HashMap::with_capacity(cmap.len());
    for (&code, utf16_bytes) in cmap.iter() {
        let utf16_values: Vec<u16> = utf16_bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();
        match String::from_utf16(&utf16_values) {
            Ok(text) => {
                unicode_map.insert(code, text);
            }
            Err(_) => {
                log::warn!("Invalid UTF-16 sequence in the ToUnicode CMap for the code {}", code);
            }
        }
    }

    Ok(Some(unicode_map))
}
