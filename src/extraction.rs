use std::collections::BTreeMap;

use lopdf::{content::Content, content::Operation, Document, Object};
use nalgebra_glm as glm;

use crate::{
    error::ContextError,
    fonts::{collect_page_fonts, object_to_f32, DecodedGlyph, PageFont},
};

/// Construct a 3x3 matrix from the six numbers of a PDF matrix `[a b c d e f]`.
/// Points transform as column vectors: `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
pub fn pdf_matrix(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> glm::Mat3 {
    glm::mat3(a, c, e, b, d, f, 0.0, 0.0, 1.0)
}

/// A pure translation matrix.
pub fn translation(tx: f32, ty: f32) -> glm::Mat3 {
    pdf_matrix(1.0, 0.0, 0.0, 1.0, tx, ty)
}

/// Transform a point through a matrix.
pub fn transform_point(matrix: &glm::Mat3, x: f32, y: f32) -> [f32; 2] {
    let point = matrix * glm::vec3(x, y, 1.0);
    [point.x, point.y]
}

/// Transform a direction (no translation) through a matrix.
pub fn transform_vector(matrix: &glm::Mat3, x: f32, y: f32) -> [f32; 2] {
    let vector = matrix * glm::vec3(x, y, 0.0);
    [vector.x, vector.y]
}

/// An axis-aligned rectangle in page space, with `y` growing upwards as in PDF.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rectangle {
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

/// One run of text produced by a single show operator, resolved into page space.
/// This is the geometric unit the overlay works with, the equivalent of a "span"
/// in the extraction dictionaries of other PDF toolkits.
#[derive(Debug, Clone)]
pub struct TextSpan {
    /// The Unicode text of the run, as decoded through the font. May contain PUA
    /// characters, which is precisely what this tool exists to repair. Empty when
    /// the font carries no usable mapping.
    pub text: String,
    /// The baseline origin of the run in page space.
    pub origin: [f32; 2],
    /// The total advance of the run along the baseline, in page units.
    pub advance_width: f32,
    /// The effective font size in page units, after the text and transformation
    /// matrices are applied.
    pub font_size: f32,
    /// The box spanned by the run, derived from the font ascent and descent.
    pub bounding_box: Rectangle,
    /// The resource name of the font the run was shown with.
    pub font_resource: Vec<u8>,
    /// The text rendering mode active for the run (3 means invisible).
    pub rendering_mode: i64,
}

/// Everything the stripping pass needs to know to place one glyph: the text matrix
/// is kept separate from the CTM because emitted path coordinates live in the user
/// space where the CTM still applies on its own.
#[derive(Debug, Clone)]
pub struct GlyphPlacement {
    /// The text matrix at the moment the glyph is shown (no CTM applied).
    pub text_matrix: glm::Mat3,
    /// The current transformation matrix at the same moment.
    pub ctm: glm::Mat3,
    /// The font size set through `Tf`.
    pub font_size: f32,
    /// The horizontal scaling as a fraction (1.0 for the default 100 percent).
    pub horizontal_scaling: f32,
    /// The text rise set through `Ts`.
    pub rise: f32,
    /// The text rendering mode active for the glyph.
    pub rendering_mode: i64,
}

/// The visitor through which the two passes observe a page's content stream. The
/// interpreter consumes every text operator; everything else is offered back for
/// pass-through.
pub trait ContentVisitor {
    /// An operator the interpreter does not consume (graphics, color, XObjects...).
    fn visit_passthrough(&mut self, _operation: &Operation) {}

    /// One glyph of a show operator, with its placement and the font it came from.
    fn visit_glyph(&mut self, _glyph: &DecodedGlyph, _placement: &GlyphPlacement, _font: &PageFont) {
    }

    /// The aggregate span of a show operator, after all its glyphs were visited.
    fn visit_span(&mut self, _span: TextSpan) {}
}

/// The graphics and text state tracked while walking a content stream. Only the
/// parts which matter for text geometry are modeled. The text and line matrices
/// are not part of the graphics state proper (they reset at `BT`), so `q`/`Q`
/// leaves them alone.
struct InterpreterState {
    ctm: glm::Mat3,
    saved_states: Vec<SavedState>,
    text_matrix: glm::Mat3,
    line_matrix: glm::Mat3,
    font_resource: Option<Vec<u8>>,
    font_size: f32,
    character_spacing: f32,
    word_spacing: f32,
    horizontal_scaling: f32,
    leading: f32,
    rise: f32,
    rendering_mode: i64,
}

/// The snapshot pushed by `q` and restored by `Q`. Besides the CTM, the graphics
/// state carries all the text parameters set through `Tf`, `Tc`, `Tw`, `Tz`,
/// `TL`, `Ts` and `Tr`.
#[derive(Clone)]
struct SavedState {
    ctm: glm::Mat3,
    font_resource: Option<Vec<u8>>,
    font_size: f32,
    character_spacing: f32,
    word_spacing: f32,
    horizontal_scaling: f32,
    leading: f32,
    rise: f32,
    rendering_mode: i64,
}

impl InterpreterState {
    fn new() -> Self {
        InterpreterState {
            ctm: glm::Mat3::identity(),
            saved_states: Vec::new(),
            text_matrix: glm::Mat3::identity(),
            line_matrix: glm::Mat3::identity(),
            font_resource: None,
            font_size: 0.0,
            character_spacing: 0.0,
            word_spacing: 0.0,
            horizontal_scaling: 1.0,
            leading: 0.0,
            rise: 0.0,
            rendering_mode: 0,
        }
    }

    fn save(&mut self) {
        self.saved_states.push(SavedState {
            ctm: self.ctm,
            font_resource: self.font_resource.clone(),
            font_size: self.font_size,
            character_spacing: self.character_spacing,
            word_spacing: self.word_spacing,
            horizontal_scaling: self.horizontal_scaling,
            leading: self.leading,
            rise: self.rise,
            rendering_mode: self.rendering_mode,
        });
    }

    fn restore(&mut self) {
        if let Some(saved) = self.saved_states.pop() {
            self.ctm = saved.ctm;
            self.font_resource = saved.font_resource;
            self.font_size = saved.font_size;
            self.character_spacing = saved.character_spacing;
            self.word_spacing = saved.word_spacing;
            self.horizontal_scaling = saved.horizontal_scaling;
            self.leading = saved.leading;
            self.rise = saved.rise;
            self.rendering_mode = saved.rendering_mode;
        } else {
            log::warn!("Unbalanced Q operator in a content stream");
        }
    }

    /// Move to the next line, as the `T*` operator and the `'`/`"` shortcuts do.
    fn next_line(&mut self) {
        self.line_matrix = self.line_matrix * translation(0.0, -self.leading);
        self.text_matrix = self.line_matrix;
    }
}

/// Walk the decoded content of a page, dispatching to the given visitor. The fonts
/// must be the ones collected from the same page's resources.
pub fn interpret_content(
    content: &Content,
    fonts: &BTreeMap<Vec<u8>, PageFont>,
    visitor: &mut dyn ContentVisitor,
) {
    let mut state = InterpreterState::new();

    for operation in &content.operations {
        let operands = &operation.operands;
        match operation.operator.as_str() {
            "q" => {
                state.save();
                visitor.visit_passthrough(operation);
            }
            "Q" => {
                state.restore();
                visitor.visit_passthrough(operation);
            }
            "cm" => {
                if let [a, b, c, d, e, f] = numbers(operands)[..] {
                    state.ctm = state.ctm * pdf_matrix(a, b, c, d, e, f);
                }
                visitor.visit_passthrough(operation);
            }
            "BT" => {
                state.text_matrix = glm::Mat3::identity();
                state.line_matrix = glm::Mat3::identity();
            }
            "ET" => {}
            "Tf" => {
                if let (Some(Object::Name(name)), Some(size)) =
                    (operands.first(), operands.get(1).and_then(object_to_f32))
                {
                    state.font_resource = Some(name.clone());
                    state.font_size = size;
                }
            }
            "Td" => {
                if let [tx, ty] = numbers(operands)[..] {
                    state.line_matrix = state.line_matrix * translation(tx, ty);
                    state.text_matrix = state.line_matrix;
                }
            }
            "TD" => {
                if let [tx, ty] = numbers(operands)[..] {
                    state.leading = -ty;
                    state.line_matrix = state.line_matrix * translation(tx, ty);
                    state.text_matrix = state.line_matrix;
                }
            }
            "Tm" => {
                if let [a, b, c, d, e, f] = numbers(operands)[..] {
                    state.line_matrix = pdf_matrix(a, b, c, d, e, f);
                    state.text_matrix = state.line_matrix;
                }
            }
            "T*" => state.next_line(),
            "TL" => {
                if let [leading] = numbers(operands)[..] {
                    state.leading = leading;
                }
            }
            "Tc" => {
                if let [spacing] = numbers(operands)[..] {
                    state.character_spacing = spacing;
                }
            }
            "Tw" => {
                if let [spacing] = numbers(operands)[..] {
                    state.word_spacing = spacing;
                }
            }
            "Tz" => {
                if let [percentage] = numbers(operands)[..] {
                    state.horizontal_scaling = percentage / 100.0;
                }
            }
            "Ts" => {
                if let [rise] = numbers(operands)[..] {
                    state.rise = rise;
                }
            }
            "Tr" => {
                if let Some(mode) = operands.first().and_then(|object| object.as_i64().ok()) {
                    state.rendering_mode = mode;
                }
            }
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    show_text(&mut state, fonts, &[ShowElement::Text(bytes)], visitor);
                }
            }
            "TJ" => {
                if let Some(Object::Array(elements)) = operands.first() {
                    let elements: Vec<ShowElement> = elements
                        .iter()
                        .map(|element| match element {
                            Object::String(bytes, _) => ShowElement::Text(bytes),
                            other => ShowElement::Offset(object_to_f32(other).unwrap_or(0.0)),
                        })
                        .collect();
                    show_text(&mut state, fonts, &elements, visitor);
                }
            }
            "'" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    state.next_line();
                    show_text(&mut state, fonts, &[ShowElement::Text(bytes)], visitor);
                }
            }
            "\"" => {
                if let (Some(word_spacing), Some(character_spacing), Some(Object::String(bytes, _))) = (
                    operands.first().and_then(object_to_f32),
                    operands.get(1).and_then(object_to_f32),
                    operands.get(2),
                ) {
                    state.word_spacing = word_spacing;
                    state.character_spacing = character_spacing;
                    state.next_line();
                    show_text(&mut state, fonts, &[ShowElement::Text(bytes)], visitor);
                }
            }
            _ => visitor.visit_passthrough(operation),
        }
    }
}

/// One element of a show operator: either bytes to decode or a kerning offset in
/// thousandths of the text space unit (the `TJ` number form).
enum ShowElement<'a> {
    Text(&'a [u8]),
    Offset(f32),
}

/// Decode and place one show operator, advancing the text matrix glyph by glyph and
/// reporting both the glyphs and the aggregate span to the visitor.
fn show_text(
    state: &mut InterpreterState,
    fonts: &BTreeMap<Vec<u8>, PageFont>,
    elements: &[ShowElement],
    visitor: &mut dyn ContentVisitor,
) {
    let Some(font_resource) = state.font_resource.clone() else {
        log::warn!("A show operator appears before any font was selected, skipping it");
        return;
    };
    let Some(font) = fonts.get(&font_resource) else {
        log::warn!(
            "The font {:?} is not among the page resources, skipping a show operator",
            String::from_utf8_lossy(&font_resource)
        );
        return;
    };

    let full_matrix_at_start = state.ctm * state.text_matrix;
    let origin = transform_point(&full_matrix_at_start, 0.0, state.rise);

    // The effective size is how long a vertical em of the nominal size ends up on
    // the page, which accounts for both the text matrix and the CTM.
    let size_vector = transform_vector(&full_matrix_at_start, 0.0, state.font_size);
    let effective_size = (size_vector[0] * size_vector[0] + size_vector[1] * size_vector[1]).sqrt();

    let mut text = String::new();

    for element in elements {
        match element {
            ShowElement::Offset(offset) => {
                // A positive TJ number moves the next glyph back by that amount,
                // expressed in thousandths of the scaled text space.
                let displacement =
                    -offset / 1000.0 * state.font_size * state.horizontal_scaling;
                state.text_matrix = state.text_matrix * translation(displacement, 0.0);
            }
            ShowElement::Text(bytes) => {
                for glyph in font.decode_show_string(bytes) {
                    let placement = GlyphPlacement {
                        text_matrix: state.text_matrix,
                        ctm: state.ctm,
                        font_size: state.font_size,
                        horizontal_scaling: state.horizontal_scaling,
                        rise: state.rise,
                        rendering_mode: state.rendering_mode,
                    };
                    visitor.visit_glyph(&glyph, &placement, font);

                    text.push_str(&glyph.text);

                    let mut displacement = glyph.advance / 1000.0 * state.font_size
                        + state.character_spacing;
                    if glyph.is_word_boundary {
                        displacement += state.word_spacing;
                    }
                    displacement *= state.horizontal_scaling;
                    state.text_matrix = state.text_matrix * translation(displacement, 0.0);
                }
            }
        }
    }

    let end = transform_point(&(state.ctm * state.text_matrix), 0.0, state.rise);
    let advance_width =
        ((end[0] - origin[0]) * (end[0] - origin[0]) + (end[1] - origin[1]) * (end[1] - origin[1]))
            .sqrt();

    // The vertical extent comes from the embedded face when one is present; the
    // usual typographic defaults are close enough otherwise.
    let (ascent, descent) = match font.face() {
        Some(face) => (
            face.ascender() as f32 / face.units_per_em() as f32,
            face.descender() as f32 / face.units_per_em() as f32,
        ),
        None => (0.8, -0.2),
    };

    let span = TextSpan {
        text,
        origin,
        advance_width,
        font_size: effective_size,
        bounding_box: Rectangle {
            x0: origin[0].min(end[0]),
            y0: origin[1] + descent * effective_size,
            x1: origin[0].max(end[0]),
            y1: origin[1] + ascent * effective_size,
        },
        font_resource,
        rendering_mode: state.rendering_mode,
    };
    visitor.visit_span(span);
}

/// Collect the numeric operands of an operation, ignoring anything non-numeric.
fn numbers(operands: &[Object]) -> Vec<f32> {
    operands.iter().filter_map(object_to_f32).collect()
}

/// A visitor which only collects spans, used by the plain extraction entry point.
struct SpanCollector {
    spans: Vec<TextSpan>,
}

impl ContentVisitor for SpanCollector {
    fn visit_span(&mut self, span: TextSpan) {
        self.spans.push(span);
    }
}

/// Run the interpreter over an already-decoded content stream and gather the
/// spans it reports.
pub fn collect_spans(
    content: &Content,
    fonts: &BTreeMap<Vec<u8>, PageFont>,
) -> Vec<TextSpan> {
    let mut collector = SpanCollector { spans: Vec::new() };
    interpret_content(content, fonts, &mut collector);
    collector.spans
}

/// Extract the text spans of a single page, in content-stream order.
pub fn extract_page_spans(
    document: &Document,
    page_id: lopdf::ObjectId,
) -> Result<Vec<TextSpan>, ContextError> {
    let content_bytes = document.get_page_content(page_id).map_err(|error| {
        ContextError::with_error("Unable to read the content stream of a page", &error)
    })?;
    let content = Content::decode(&content_bytes).map_err(|error| {
        ContextError::with_error("Unable to decode the content stream of a page", &error)
    })?;
    let fonts = collect_page_fonts(document, page_id);

    Ok(collect_spans(&content, &fonts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn synthetic_simple_font() -> PageFont {
        PageFont::synthetic_for_tests(
            b"F1".to_vec(),
            crate::fonts::CodeLayout::OneByte,
            Some(
                (b'a'..=b'z')
                    .map(|byte| (u32::from(byte), (byte as char).to_string()))
                    .chain(std::iter::once((32, " ".to_string())))
                    .collect::<HashMap<u32, String>>(),
            ),
            HashMap::new(),
            500.0,
        )
    }

    fn fonts_map(font: PageFont) -> BTreeMap<Vec<u8>, PageFont> {
        let mut fonts = BTreeMap::new();
        fonts.insert(font.resource_name.clone(), font);
        fonts
    }

    fn content(operations: Vec<Operation>) -> Content {
        Content { operations }
    }

    fn collect(operations: Vec<Operation>, fonts: &BTreeMap<Vec<u8>, PageFont>) -> Vec<TextSpan> {
        let mut collector = SpanCollector { spans: Vec::new() };
        interpret_content(&content(operations), fonts, &mut collector);
        collector.spans
    }

    #[test]
    fn a_simple_show_operator_produces_a_positioned_span() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 12.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"ab".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        similar_asserts::assert_eq!(span.text, "ab");
        assert_eq!(span.origin, [72.0, 700.0]);
        assert!((span.font_size - 12.0).abs() < 1e-4);
        // Two glyphs of 500 thousandths each at size 12: 2 * 0.5 * 12.
        assert!((span.advance_width - 12.0).abs() < 1e-4);
        assert_eq!(span.rendering_mode, 0);
    }

    #[test]
    fn the_ctm_scales_both_position_and_size() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new(
                    "cm",
                    vec![2.into(), 0.into(), 0.into(), 2.into(), 10.into(), 0.into()],
                ),
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 10.into()]),
                Operation::new("Td", vec![50.into(), 100.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"a".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.origin, [110.0, 200.0]);
        assert!((span.font_size - 20.0).abs() < 1e-4);
        assert!((span.advance_width - 10.0).abs() < 1e-4);
    }

    #[test]
    fn tj_offsets_shorten_the_advance() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 10.into()]),
                Operation::new(
                    "TJ",
                    vec![Object::Array(vec![
                        Object::String(b"a".to_vec(), lopdf::StringFormat::Literal),
                        200.into(),
                        Object::String(b"b".to_vec(), lopdf::StringFormat::Literal),
                    ])],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        assert_eq!(spans.len(), 1);
        // Two glyphs of 5 units each, minus the 200/1000 * 10 kern.
        assert!((spans[0].advance_width - 8.0).abs() < 1e-4);
        similar_asserts::assert_eq!(spans[0].text, "ab");
    }

    #[test]
    fn word_spacing_applies_to_the_space_code_only() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 10.into()]),
                Operation::new("Tw", vec![3.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"a b".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        // Three glyphs of 5 units each plus one word spacing of 3.
        assert!((spans[0].advance_width - 18.0).abs() < 1e-4);
    }

    #[test]
    fn invisible_rendering_mode_is_reported_on_the_span() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 10.into()]),
                Operation::new("Tr", vec![3.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"a".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        assert_eq!(spans[0].rendering_mode, 3);
    }

    #[test]
    fn text_parameters_set_inside_a_q_bracket_do_not_leak_past_the_matching_grestore() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new("q", vec![]),
                Operation::new("Tc", vec![5.into()]),
                Operation::new("Tr", vec![3.into()]),
                Operation::new("Q", vec![]),
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 10.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"ab".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        assert_eq!(spans.len(), 1);
        // Two glyphs of 5 units each, with no character spacing left over.
        assert!((spans[0].advance_width - 10.0).abs() < 1e-4);
        assert_eq!(spans[0].rendering_mode, 0);
    }

    #[test]
    fn successive_td_operators_start_new_lines_relative_to_the_previous_one() {
        let fonts = fonts_map(synthetic_simple_font());
        let spans = collect(
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 10.into()]),
                Operation::new("Td", vec![100.into(), 700.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"a".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("Td", vec![0.into(), Object::Integer(-14)]),
                Operation::new(
                    "Tj",
                    vec![Object::String(b"b".to_vec(), lopdf::StringFormat::Literal)],
                ),
                Operation::new("ET", vec![]),
            ],
            &fonts,
        );

        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].origin, [100.0, 700.0]);
        assert_eq!(spans[1].origin, [100.0, 686.0]);
    }
}
