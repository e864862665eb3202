use std::path::Path;

use lopdf::{content::Operation, Object, StringFormat};

use crate::{
    error::ContextError,
    fonts::TtfFontFace,
    layouting::{GlyphWidths, SpanLayout},
};

/// The resource name the overlay font is registered under on every repaired page.
/// The stripping pass removes every original font, so the name cannot collide.
pub const OVERLAY_FONT_RESOURCE: &str = "F0";

/// How the overlay text layer should be painted.
#[derive(Debug, Clone, Copy)]
pub struct OverlayStyle {
    /// When false, the text is written in rendering mode 3: present for search and
    /// copy-paste but leaving no ink on the page.
    pub visible: bool,
    /// The RGB fill color used when the overlay is visible.
    pub color: [f32; 3],
}

impl Default for OverlayStyle {
    fn default() -> Self {
        // Blue stands out against the black ink of most pages when proofreading.
        OverlayStyle {
            visible: false,
            color: [0.0, 0.0, 1.0],
        }
    }
}

/// The font the corrected Unicode text layer is written with. It is embedded whole
/// into the output document as a Type0/CIDFontType2 font with the Identity-H
/// encoding, so the show-strings are sequences of big-endian glyph IDs, and a
/// generated ToUnicode CMap makes the text round-trip to Unicode on extraction.
#[derive(Debug, Clone)]
pub struct OverlayFont {
    /// The byte data the font was loaded from.
    bytes: Vec<u8>,
    /// The actual font face, together with its measure of units per em.
    ttf_face: TtfFontFace,
    /// The identifier of the font face inside the PDF.
    face_identifier: String,
}

impl GlyphWidths for OverlayFont {
    fn advance_for_char(&self, character: char) -> Option<f32> {
        let glyph_id = self.ttf_face.glyph_id(character)?;
        self.ttf_face.glyph_advance_in_thousandths(glyph_id)
    }
}

impl OverlayFont {
    /// Load the overlay font from a TTF/OTF file on disk.
    pub fn from_file(font_path: &Path) -> Result<Self, ContextError> {
        let font_bytes = std::fs::read(font_path).map_err(|error| {
            ContextError::with_error(
                format!("Failed to read the overlay font {:?}", font_path),
                &error,
            )
        })?;
        Self::from_bytes(font_bytes)
    }

    /// Construct the overlay font from raw TTF data.
    pub fn from_bytes(font_bytes: Vec<u8>) -> Result<Self, ContextError> {
        let ttf_face = TtfFontFace::from_bytes(&font_bytes)?;
        Ok(OverlayFont {
            bytes: font_bytes,
            ttf_face,
            face_identifier: OVERLAY_FONT_RESOURCE.to_string(),
        })
    }

    /// The face the font was parsed into.
    pub fn face(&self) -> &TtfFontFace {
        &self.ttf_face
    }

    /// Encode a string into the byte form expected inside show operators: big-endian
    /// glyph IDs, two bytes each. Characters without a glyph are skipped, since the
    /// layout already dropped them.
    pub fn encode_text(&self, text: &str) -> Vec<u8> {
        let mut glyph_id_bytes = Vec::with_capacity(text.len() * 2);
        for character in text.chars() {
            if let Some(glyph_id) = self.ttf_face.glyph_id(character) {
                glyph_id_bytes.push((glyph_id >> 8) as u8);
                glyph_id_bytes.push((glyph_id & 255) as u8);
            } else {
                log::warn!("Unable to find the character {:?} in the overlay font", character);
            }
        }
        glyph_id_bytes
    }

    /// Produce the content-stream operations which paint one span layout. The whole
    /// run sits in a single text object: the caret advances by the natural glyph
    /// widths, consecutive characters of equal size share a show operator, and the
    /// horizontal scaling stretches the run to the measured span width.
    pub fn layout_operations(&self, layout: &SpanLayout, style: &OverlayStyle) -> Vec<Operation> {
        layout_operations_with(
            &self.face_identifier,
            |text| self.encode_text(text),
            layout,
            style,
        )
    }

    /// Takes the font and inserts it into the PDF document, returning the font PDF
    /// dictionary to be referenced from the page resources.
    pub fn insert_into_document(&self, inner_document: &mut lopdf::Document) -> lopdf::Dictionary {
        use lopdf::Object::*;

        // The font program itself. `Length1` carries the uncompressed byte length,
        // which the PDF specification requires for TrueType streams.
        let font_stream = lopdf::Stream::new(
            lopdf::Dictionary::from_iter(vec![("Length1", Integer(self.bytes.len() as i64))]),
            self.bytes.clone(),
        )
        .with_compression(false);

        let face_metrics_scale = 1000.0 / (self.ttf_face.units_per_em() as f32);
        let ascent = (self.ttf_face.ascender() as f32 * face_metrics_scale) as i64;
        let descent = (self.ttf_face.descender() as f32 * face_metrics_scale) as i64;

        let mut font_vector: Vec<(::std::string::String, lopdf::Object)> = vec![
            ("Type".into(), Name("Font".into())),
            ("Subtype".into(), Name("Type0".into())),
            (
                "BaseFont".into(),
                Name(self.face_identifier.clone().into_bytes()),
            ),
            // `Identity-H` is used for horizontal writing: the show-string bytes are
            // the glyph IDs themselves.
            ("Encoding".into(), Name("Identity-H".into())),
        ];

        let font_descriptor_vector: Vec<(::std::string::String, lopdf::Object)> = vec![
            ("Type".into(), Name("FontDescriptor".into())),
            (
                "FontName".into(),
                Name(self.face_identifier.clone().into_bytes()),
            ),
            ("Ascent".into(), Integer(ascent)),
            ("Descent".into(), Integer(descent)),
            ("CapHeight".into(), Integer(ascent)),
            ("ItalicAngle".into(), Integer(0)),
            // The font uses the Adobe standard Latin character set or a subset of it.
            ("Flags".into(), Integer(32)),
            // An approximately appropriate default, the true value is not recoverable
            // from the TTF tables.
            ("StemV".into(), Integer(80)),
        ];

        // Collect per-glyph widths and the character each glyph stands for: the
        // widths feed the `W` array, the characters feed the ToUnicode CMap.
        let gid_to_codepoint_map = self.ttf_face.glyph_ids();
        let mut gid_and_character: Vec<(u16, char)> = gid_to_codepoint_map.into_iter().collect();
        gid_and_character.sort_by_key(|(glyph_id, _)| *glyph_id);

        // Glyph IDs in a (beginbfchar endbfchar) block must share their high byte,
        // and a block holds at most 100 entries.
        let mut all_gid_to_character_blocks = Vec::new();
        let mut current_block: Vec<(u32, u32)> = Vec::new();
        let mut current_high_byte: u16 = 0;
        for (glyph_id, character) in &gid_and_character {
            if (glyph_id >> 8) != current_high_byte || current_block.len() >= 100 {
                all_gid_to_character_blocks.push(std::mem::take(&mut current_block));
                current_high_byte = glyph_id >> 8;
            }
            current_block.push((u32::from(*glyph_id), *character as u32));
        }
        all_gid_to_character_blocks.push(current_block);

        let cid_to_unicode_map = generate_cid_to_unicode_map(
            self.face_identifier.clone(),
            all_gid_to_character_blocks,
        );
        let cid_to_unicode_map_stream = lopdf::Stream::new(
            lopdf::Dictionary::new(),
            cid_to_unicode_map.into_bytes(),
        );
        let cid_to_unicode_map_stream_id = inner_document.add_object(cid_to_unicode_map_stream);

        // Encode the widths the way the PDF specification expects: runs of
        // consecutive glyph IDs share one `first_gid [w1 w2 ...]` group.
        let mut width_objects = Vec::<Object>::new();
        let mut current_lesser_glyph_id = 0;
        let mut current_upper_gid = 0;
        let mut current_widths_vector = Vec::<Object>::new();

        for glyph_id in 0..self.ttf_face.glyph_count() {
            let Some(width) = self.ttf_face.glyph_advance_in_thousandths(glyph_id) else {
                log::warn!(
                    "Glyph ID {} of the overlay font has no width, skipping it",
                    glyph_id
                );
                continue;
            };
            if glyph_id == current_upper_gid {
                current_widths_vector.push(Integer(width as i64));
                current_upper_gid += 1;
            } else {
                width_objects.push(Integer(current_lesser_glyph_id as i64));
                width_objects.push(Array(std::mem::take(&mut current_widths_vector)));

                current_widths_vector.push(Integer(width as i64));
                current_lesser_glyph_id = glyph_id;
                current_upper_gid = glyph_id + 1;
            }
        }
        // The loop is delayed by one group, push the last widths in any case.
        width_objects.push(Integer(current_lesser_glyph_id as i64));
        width_objects.push(Array(std::mem::take(&mut current_widths_vector)));

        let mut font_descriptors = lopdf::Dictionary::from_iter(vec![
            ("Type", Name("Font".into())),
            ("Subtype", Name("CIDFontType2".into())),
            ("BaseFont", Name(self.face_identifier.clone().into())),
            (
                "CIDSystemInfo",
                Dictionary(lopdf::Dictionary::from_iter(vec![
                    ("Registry", String("Adobe".into(), StringFormat::Literal)),
                    ("Ordering", String("Identity".into(), StringFormat::Literal)),
                    ("Supplement", Integer(0)),
                ])),
            ),
            ("CIDToGIDMap", Name("Identity".into())),
            ("W", Array(width_objects)),
            ("DW", Integer(1000)),
        ]);

        let mut font_descriptor_vector = font_descriptor_vector;
        font_descriptor_vector.push((
            "FontFile2".into(),
            Reference(inner_document.add_object(font_stream)),
        ));
        // Although technically derivable from the program, Adobe Reader wants an
        // explicit FontBBox on the descriptor.
        font_descriptor_vector.push((
            "FontBBox".into(),
            Array(vec![
                Integer(0),
                Integer(descent),
                Integer(1000),
                Integer(ascent),
            ]),
        ));

        let font_descriptor_vector_id =
            inner_document.add_object(lopdf::Dictionary::from_iter(font_descriptor_vector));
        font_descriptors.set("FontDescriptor", Reference(font_descriptor_vector_id));

        font_vector.push((
            "DescendantFonts".into(),
            Array(vec![Dictionary(font_descriptors)]),
        ));
        font_vector.push(("ToUnicode".into(), Reference(cid_to_unicode_map_stream_id)));

        lopdf::Dictionary::from_iter(font_vector)
    }
}

/// Operator emission for one span, with the show-string encoding injected so the
/// operation shape can be tested without a font file on disk.
fn layout_operations_with(
    face_identifier: &str,
    encode: impl Fn(&str) -> Vec<u8>,
    layout: &SpanLayout,
    style: &OverlayStyle,
) -> Vec<Operation> {
    let mut operations = vec![Operation::new("BT", vec![])];

    if style.visible {
        let [r, g, b] = style.color;
        operations.push(Operation::new(
            "rg",
            vec![r, g, b].into_iter().map(Object::Real).collect(),
        ));
        operations.push(Operation::new("Tr", vec![0.into()]));
    } else {
        // Rendering mode 3: the text participates in search and selection but
        // paints nothing.
        operations.push(Operation::new("Tr", vec![3.into()]));
    }

    operations.push(Operation::new(
        "Tz",
        vec![Object::Real(layout.horizontal_scaling)],
    ));
    let [x, y] = layout.origin;
    operations.push(Operation::new(
        "Tm",
        vec![
            Object::Real(1.0),
            Object::Real(0.0),
            Object::Real(0.0),
            Object::Real(1.0),
            Object::Real(x),
            Object::Real(y),
        ],
    ));

    // Group runs of equal size so a span of ordinary text stays one Tf and one
    // show operator.
    let mut index = 0;
    while index < layout.characters.len() {
        let run_size = layout.characters[index].font_size;
        let mut run_text = String::new();
        while index < layout.characters.len()
            && (layout.characters[index].font_size - run_size).abs() < 1e-4
        {
            run_text.push(layout.characters[index].character);
            index += 1;
        }

        operations.push(Operation::new(
            "Tf",
            vec![face_identifier.into(), Object::Real(run_size)],
        ));
        operations.push(Operation::new(
            "Tj",
            vec![Object::String(encode(&run_text), StringFormat::Hexadecimal)],
        ));
    }

    operations.push(Operation::new("ET", vec![]));
    operations
}

type CmapBlock = Vec<(u32, u32)>;

/// Generates a ToUnicode CMAP from glyph-ID/codepoint blocks. The predefined
/// beginning and end sections are inserted at compile time.
fn generate_cid_to_unicode_map(face_name: String, all_cmap_blocks: Vec<CmapBlock>) -> String {
    let mut cid_to_unicode_map =
        format!(include_str!("../assets/cid_to_unicode_beg.txt"), face_name);

    for cmap_block in all_cmap_blocks {
        let entries: Vec<(u32, char)> = cmap_block
            .into_iter()
            .filter_map(|(glyph_id, unicode)| {
                char::from_u32(unicode).map(|character| (glyph_id, character))
            })
            .collect();
        if entries.is_empty() {
            continue;
        }

        cid_to_unicode_map.push_str(format!("{} beginbfchar\r\n", entries.len()).as_str());
        for (glyph_id, character) in entries {
            // The bfchar destination is UTF-16BE, so characters beyond the Basic
            // Multilingual Plane become a surrogate pair of two code units.
            let mut destination = String::new();
            let mut units = [0_u16; 2];
            for unit in character.encode_utf16(&mut units) {
                destination.push_str(format!("{unit:04x}").as_str());
            }
            cid_to_unicode_map.push_str(format!("<{glyph_id:04x}> <{destination}>\n").as_str());
        }
        cid_to_unicode_map.push_str("endbfchar\r\n");
    }

    cid_to_unicode_map.push_str(include_str!("../assets/cid_to_unicode_end.txt"));

    cid_to_unicode_map
}
