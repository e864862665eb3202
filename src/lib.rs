//! Depua repairs PDF documents whose text layer came out of an OCR pipeline with
//! Private Use Area code points instead of proper Unicode. Such documents look
//! fine on screen because the embedded fonts carry the right glyph shapes, but
//! copying or searching their text yields garbage.
//!
//! The repair happens in two passes over every page. The first pass strips the
//! selectable text layer while preserving the page's appearance: each shown glyph
//! is replaced in place by the path-painting operations of its outline, taken
//! from the embedded font program. The second pass rebuilds a text layer on top,
//! remapping every PUA code point through a mapping table into the Unicode
//! sequence it stands for, and positioning the corrected text over the original
//! glyph geometry. The overlay is invisible by default (the text participates in
//! search and selection without leaving any ink) or visibly colored for
//! proofreading.
//!
//! The entry points are `document::repair_file` for the whole pipeline and
//! `document::dump_text` for inspecting the text layer of a PDF. The individual
//! passes are exposed by the `extraction`, `stripping`, `layouting` and
//! `embedding` modules for programmatic use.

/// The end-to-end pipeline: `RepairOptions`, `repair_file` and `dump_text`.
///
/// A repair loads the document with `lopdf`, rewrites the content stream of every
/// page (strip pass, then the overlay operations appended after a `q`/`Q` bracket
/// around the original content), points the page resources at the single embedded
/// overlay font, stamps the modification date and saves an optimized document.
pub mod document;

/// The overlay font machinery: loading a TTF/OTF file, embedding it into the
/// output document as a Type0/CIDFontType2 font with Identity-H encoding and a
/// generated ToUnicode CMap, and producing the content-stream operations which
/// paint one laid-out span.
pub mod embedding;

/// This module contains the `ContextError` type which is the error type used throughout this library.
///
/// The reason why this type has been implemented is to uniform the error reporting without delving too deep
/// into specific error codes which for such library would be too many and definitely out of scope.
///
/// The `ContextError` type is always returned from a `Result` type, which means that the end user can expect to obtain an explanation
/// whenever a function returns an error. If an error happened in a function which was called inside a function of this library,
/// then the user can expect to also obtain information about this propagated error.
pub mod error;

/// A content-stream interpreter built on `lopdf`: it tracks the graphics and
/// text state well enough to report, for every show operator, where each glyph
/// lands on the page and how wide the run is. Both the strip pass and the span
/// extraction are visitors over this interpreter.
pub mod extraction;

/// The model of the fonts referenced by a source page: ToUnicode CMaps,
/// per-code advance widths and the embedded TrueType program, parsed just far
/// enough to decode show-strings and outline glyphs. No shaping happens here.
pub mod fonts;

/// Overlay layout arithmetic: remapped text is sized from the original span,
/// characters born from a multi-character expansion share the box of the single
/// glyph they replace, and a horizontal-scaling percentage fits the run to the
/// measured span width.
pub mod layouting;

/// The PUA mapping table, with a built-in default covering the documented Adobe
/// corporate-use assignments and JSON loading for engine-specific tables.
pub mod mapping;

/// The strip pass: rewrite a page's content stream so that nothing selectable
/// remains, replacing every text object with the vector outlines of its glyphs.
pub mod stripping;
