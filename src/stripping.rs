use std::collections::BTreeMap;

use lopdf::{content::Content, content::Operation, Object};
use nalgebra_glm as glm;

use crate::{
    extraction::{interpret_content, pdf_matrix, transform_point, ContentVisitor, GlyphPlacement},
    fonts::{DecodedGlyph, PageFont},
};

/// The result of stripping the text layer out of one page's content stream.
#[derive(Debug)]
pub struct StripOutcome {
    /// The rewritten operations: all the original graphics with every text object
    /// replaced by path-painting operations.
    pub operations: Vec<Operation>,
    /// How many glyphs were converted into filled outlines.
    pub painted_glyphs: usize,
    /// How many visible glyphs had to be removed because no outline was available.
    pub dropped_glyphs: usize,
    /// How many glyphs were shown in the invisible rendering mode and were removed
    /// without a visual replacement (the classic OCR text layer).
    pub invisible_glyphs: usize,
}

/// Rewrite a page's content so that nothing selectable remains: text-showing
/// operators become vector paths, every other operator passes through untouched.
///
/// The emitted path coordinates live in the same user space as the show operator
/// they replace, so the surrounding graphics state (clip, fill color, CTM) keeps
/// applying to them exactly as it applied to the glyphs.
pub fn strip_page_text(
    content: &Content,
    fonts: &BTreeMap<Vec<u8>, PageFont>,
) -> StripOutcome {
    let mut visitor = StripVisitor {
        operations: Vec::new(),
        painted_glyphs: 0,
        dropped_glyphs: 0,
        invisible_glyphs: 0,
    };
    interpret_content(content, fonts, &mut visitor);

    if visitor.dropped_glyphs > 0 {
        log::warn!(
            "Removed {} visible glyphs with no embeddable outline, the page may lose some ink",
            visitor.dropped_glyphs
        );
    }

    StripOutcome {
        operations: visitor.operations,
        painted_glyphs: visitor.painted_glyphs,
        dropped_glyphs: visitor.dropped_glyphs,
        invisible_glyphs: visitor.invisible_glyphs,
    }
}

struct StripVisitor {
    operations: Vec<Operation>,
    painted_glyphs: usize,
    dropped_glyphs: usize,
    invisible_glyphs: usize,
}

impl ContentVisitor for StripVisitor {
    fn visit_passthrough(&mut self, operation: &Operation) {
        self.operations.push(operation.clone());
    }

    fn visit_glyph(&mut self, glyph: &DecodedGlyph, placement: &GlyphPlacement, font: &PageFont) {
        // Rendering mode 3 never left any ink on the page, so removing the glyph is
        // the whole job.
        if placement.rendering_mode == 3 {
            self.invisible_glyphs += 1;
            return;
        }

        let outlined = glyph.glyph_id.and_then(|glyph_id| {
            let face = font.face()?;
            // Glyph space is in font units; this matrix takes it through the em
            // square scaling, the font size, the horizontal scaling and the rise,
            // and finally through the text matrix into user space.
            let units_per_em = face.units_per_em() as f32;
            let scale = pdf_matrix(
                placement.font_size * placement.horizontal_scaling / units_per_em,
                0.0,
                0.0,
                placement.font_size / units_per_em,
                0.0,
                placement.rise,
            );
            let matrix = placement.text_matrix * scale;

            let mut builder = PathBuilder::new(matrix);
            face.outline_glyph(glyph_id, &mut builder)?;
            Some(builder.operations)
        });

        match outlined {
            Some(path_operations) if !path_operations.is_empty() => {
                self.operations.extend(path_operations);
                // Nonzero-winding fill matches how glyph outlines are rasterized.
                self.operations.push(Operation::new("f", vec![]));
                self.painted_glyphs += 1;
            }
            Some(_) => {
                // An empty outline is a blank glyph (a space): nothing to paint.
                self.painted_glyphs += 1;
            }
            None => {
                // Whitespace glyphs have no outline to begin with, losing them
                // loses nothing.
                if !glyph.text.is_empty() && glyph.text.chars().all(char::is_whitespace) {
                    self.painted_glyphs += 1;
                } else {
                    log::debug!(
                        "No outline for the code {} in the font {:?}",
                        glyph.code,
                        font.base_font
                    );
                    self.dropped_glyphs += 1;
                }
            }
        }
    }
}

/// Builds PDF path-construction operations while walking a glyph outline. Quadratic
/// segments are raised to cubic ones, since PDF content streams only know `c`.
struct PathBuilder {
    matrix: glm::Mat3,
    operations: Vec<Operation>,
    /// The current point in glyph space, needed to raise quadratic segments.
    current: (f32, f32),
}

impl PathBuilder {
    fn new(matrix: glm::Mat3) -> Self {
        PathBuilder {
            matrix,
            operations: Vec::new(),
            current: (0.0, 0.0),
        }
    }

    fn point_operands(&self, points: &[(f32, f32)]) -> Vec<Object> {
        points
            .iter()
            .flat_map(|&(x, y)| {
                let [x, y] = transform_point(&self.matrix, x, y);
                [Object::Real(x), Object::Real(y)]
            })
            .collect()
    }
}

impl owned_ttf_parser::OutlineBuilder for PathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        self.current = (x, y);
        self.operations
            .push(Operation::new("m", self.point_operands(&[(x, y)])));
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.current = (x, y);
        self.operations
            .push(Operation::new("l", self.point_operands(&[(x, y)])));
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        // A quadratic segment with control q is the cubic whose controls sit at a
        // third of the way from each endpoint towards q.
        let (x0, y0) = self.current;
        let c1 = (x0 + 2.0 / 3.0 * (x1 - x0), y0 + 2.0 / 3.0 * (y1 - y0));
        let c2 = (x + 2.0 / 3.0 * (x1 - x), y + 2.0 / 3.0 * (y1 - y));
        self.current = (x, y);
        self.operations
            .push(Operation::new("c", self.point_operands(&[c1, c2, (x, y)])));
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.current = (x, y);
        self.operations.push(Operation::new(
            "c",
            self.point_operands(&[(x1, y1), (x2, y2), (x, y)]),
        ));
    }

    fn close(&mut self) {
        self.operations.push(Operation::new("h", vec![]));
    }
}
