use unicode_normalization::UnicodeNormalization as _;

use crate::{extraction::TextSpan, mapping::PuaTable};

/// The overlay text is set slightly larger than the measured span size, so that the
/// selectable area covers the glyph boxes instead of undershooting them.
pub const OVERLAY_SIZE_FACTOR: f32 = 1.1;

/// Bounds for the horizontal scaling used to fit a run into the original span width,
/// as a percentage. Values outside this range mean the measurement went wrong, and a
/// grotesquely squeezed run is worse than an overhanging one.
pub const MINIMUM_HORIZONTAL_SCALING: f32 = 20.0;
pub const MAXIMUM_HORIZONTAL_SCALING: f32 = 500.0;

/// The source of character advances for the overlay font: a trait seam so the layout
/// arithmetic can be exercised without a real font file.
pub trait GlyphWidths {
    /// The horizontal advance for a character in thousandths of the em square, or
    /// `None` when the font has no glyph for it.
    fn advance_for_char(&self, character: char) -> Option<f32>;
}

/// One character of the overlay, with the size it must be set at and its natural
/// advance (before horizontal scaling) in page units.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedCharacter {
    pub character: char,
    pub font_size: f32,
    pub advance: f32,
}

/// The overlay layout of a single span: characters at their sizes, the baseline
/// origin they start from, and the horizontal scaling which fits their natural width
/// into the span's measured advance.
#[derive(Debug, Clone)]
pub struct SpanLayout {
    pub characters: Vec<PlacedCharacter>,
    pub origin: [f32; 2],
    /// As a percentage, the unit of the `Tz` operator.
    pub horizontal_scaling: f32,
    /// Characters dropped because the overlay font has no glyph for them.
    pub skipped_characters: usize,
}

impl SpanLayout {
    /// The text of the layout, in order.
    pub fn text(&self) -> String {
        self.characters
            .iter()
            .map(|placed| placed.character)
            .collect()
    }

    /// The width the run takes before horizontal scaling.
    pub fn natural_width(&self) -> f32 {
        self.characters.iter().map(|placed| placed.advance).sum()
    }
}

/// Lay the corrected text of a span over the original glyph geometry.
///
/// Each source character is expanded through the mapping table; when one PUA glyph
/// expands into an n-character sequence, every character of the sequence is set at
/// `1/n` of the overlay size so the sequence occupies roughly the box of the single
/// glyph it replaces. The run is then fitted to the span's measured advance width
/// with horizontal scaling.
///
/// Returns `None` when the span has no decodable text or none of its characters
/// exist in the overlay font.
pub fn layout_span(
    span: &TextSpan,
    table: &PuaTable,
    widths: &dyn GlyphWidths,
) -> Option<SpanLayout> {
    if span.text.is_empty() {
        return None;
    }

    let overlay_size = span.font_size * OVERLAY_SIZE_FACTOR;
    let mut characters = Vec::new();
    let mut skipped_characters = 0;

    for source_character in span.text.chars() {
        // Normalizing per expansion lets jamo sequences compose into the syllables
        // the overlay font actually has glyphs for.
        let expansion: String = table.expand(source_character).nfc().collect();
        let expansion_length = expansion.chars().count().max(1);
        let character_size = overlay_size / expansion_length as f32;

        for character in expansion.chars() {
            match widths.advance_for_char(character) {
                Some(advance) => characters.push(PlacedCharacter {
                    character,
                    font_size: character_size,
                    advance: advance / 1000.0 * character_size,
                }),
                None => {
                    log::warn!(
                        "The overlay font has no glyph for {:?}, dropping it from the text layer",
                        character
                    );
                    skipped_characters += 1;
                }
            }
        }
    }

    if characters.is_empty() {
        return None;
    }

    let natural_width: f32 = characters.iter().map(|placed| placed.advance).sum();
    let horizontal_scaling = if natural_width > f32::EPSILON && span.advance_width > f32::EPSILON {
        (span.advance_width / natural_width * 100.0)
            .clamp(MINIMUM_HORIZONTAL_SCALING, MAXIMUM_HORIZONTAL_SCALING)
    } else {
        100.0
    };

    Some(SpanLayout {
        characters,
        origin: span.origin,
        horizontal_scaling,
        skipped_characters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::Rectangle;

    /// Every glyph is half an em wide, except characters the stub refuses to know.
    struct FixedWidths {
        missing: Vec<char>,
    }

    impl GlyphWidths for FixedWidths {
        fn advance_for_char(&self, character: char) -> Option<f32> {
            if self.missing.contains(&character) {
                None
            } else {
                Some(500.0)
            }
        }
    }

    fn span(text: &str, advance_width: f32, font_size: f32) -> TextSpan {
        TextSpan {
            text: text.to_string(),
            origin: [72.0, 700.0],
            advance_width,
            font_size,
            bounding_box: Rectangle {
                x0: 72.0,
                y0: 697.0,
                x1: 72.0 + advance_width,
                y1: 712.0,
            },
            font_resource: b"F1".to_vec(),
            rendering_mode: 0,
        }
    }

    #[test]
    fn plain_text_is_set_at_the_overlay_size() {
        let widths = FixedWidths { missing: vec![] };
        let layout = layout_span(&span("ab", 11.0, 10.0), &PuaTable::default(), &widths).unwrap();

        assert_eq!(layout.characters.len(), 2);
        for placed in &layout.characters {
            assert!((placed.font_size - 11.0).abs() < 1e-4);
            assert!((placed.advance - 5.5).abs() < 1e-4);
        }
        // Natural width happens to equal the span advance, so no scaling is needed.
        assert!((layout.horizontal_scaling - 100.0).abs() < 1e-3);
    }

    #[test]
    fn an_expanding_glyph_divides_its_size_across_the_sequence() {
        let mut table = PuaTable::empty();
        table.insert('\u{E000}', "abc");
        let widths = FixedWidths { missing: vec![] };
        let layout = layout_span(&span("\u{E000}", 6.0, 12.0), &table, &widths).unwrap();

        assert_eq!(layout.text(), "abc");
        for placed in &layout.characters {
            assert!((placed.font_size - 4.4).abs() < 1e-4); // 12 * 1.1 / 3
        }
    }

    #[test]
    fn expansions_compose_before_measuring() {
        let mut table = PuaTable::empty();
        table.insert('\u{E0BC}', "\u{1112}\u{1161}\u{11AB}");
        let widths = FixedWidths { missing: vec![] };
        let layout = layout_span(&span("\u{E0BC}", 10.0, 10.0), &table, &widths).unwrap();

        // The jamo sequence composes into a single syllable, which therefore keeps
        // the full overlay size instead of a third of it.
        assert_eq!(layout.text(), "\u{D55C}");
        assert!((layout.characters[0].font_size - 11.0).abs() < 1e-4);
    }

    #[test]
    fn the_run_is_fitted_to_the_span_advance() {
        let widths = FixedWidths { missing: vec![] };
        // Natural width: 2 chars * 0.5 em * 11 = 11; span advance 22 asks for 200%.
        let layout = layout_span(&span("ab", 22.0, 10.0), &PuaTable::default(), &widths).unwrap();
        assert!((layout.horizontal_scaling - 200.0).abs() < 1e-3);

        // A degenerate measurement clamps instead of exploding.
        let layout = layout_span(&span("ab", 1000.0, 10.0), &PuaTable::default(), &widths).unwrap();
        assert_eq!(layout.horizontal_scaling, MAXIMUM_HORIZONTAL_SCALING);
    }

    #[test]
    fn characters_missing_from_the_overlay_font_are_counted() {
        let widths = FixedWidths { missing: vec!['b'] };
        let layout = layout_span(&span("ab", 10.0, 10.0), &PuaTable::default(), &widths).unwrap();
        assert_eq!(layout.text(), "a");
        assert_eq!(layout.skipped_characters, 1);
    }

    #[test]
    fn spans_with_nothing_to_place_produce_no_layout() {
        let widths = FixedWidths { missing: vec!['x'] };
        assert!(layout_span(&span("", 10.0, 10.0), &PuaTable::default(), &widths).is_none());
        assert!(layout_span(&span("x", 10.0, 10.0), &PuaTable::default(), &widths).is_none());
    }
}
