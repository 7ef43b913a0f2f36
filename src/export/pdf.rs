use super::{ExportError, REPORT_TITLE, generated_on, pretty_payload};
use chrono::{DateTime, Utc};
use printpdf::{
    BuiltinFont, Color, IndirectFontRef, Mm, PdfDocument, PdfLayerReference, Pt, Rgb, TextMatrix,
};
use serde_json::{Map, Value};

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const LEFT: f32 = 50.0;
const BOTTOM_MARGIN: f32 = 50.0;
const LINE_HEIGHT: f32 = 15.0;
const BODY_SIZE: f32 = 10.0;
/// Helvetica at 10pt over the 495pt printable width.
const WRAP_COLUMNS: usize = 90;
const WATERMARK: &str = "CONFIDENTIAL";
const LAYER: &str = "report";

/// A body line and the baseline it is drawn at, in points from the bottom edge.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedLine {
    pub y: f32,
    pub text: String,
}

/// Cover heading, timestamp and watermark on the first page, then the
/// pretty-printed payload flowed over as many pages as it needs.
pub fn to_pdf(
    data: &Map<String, Value>,
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>, ExportError> {
    let body = pretty_payload(data)?;
    ensure_win_ansi(&body)?;
    let pages = paginate(&wrap_lines(&body, WRAP_COLUMNS));

    let (doc, first_page, first_layer) =
        PdfDocument::new(REPORT_TITLE, mm(PAGE_WIDTH), mm(PAGE_HEIGHT), LAYER);
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|err| ExportError::Pdf(err.to_string()))?;

    let cover = doc.get_page(first_page).get_layer(first_layer);
    draw_watermark(&cover, &font);
    cover.set_fill_color(grey(0.1));
    cover.use_text(REPORT_TITLE, 20.0, mm(LEFT), mm(PAGE_HEIGHT - 50.0), &font);
    cover.set_fill_color(grey(0.3));
    cover.use_text(
        generated_on(generated_at),
        12.0,
        mm(LEFT),
        mm(PAGE_HEIGHT - 80.0),
        &font,
    );

    let mut pages = pages.iter();
    if let Some(lines) = pages.next() {
        draw_body(&cover, &font, lines);
    }
    for lines in pages {
        let (page, layer) = doc.add_page(mm(PAGE_WIDTH), mm(PAGE_HEIGHT), LAYER);
        let layer = doc.get_page(page).get_layer(layer);
        draw_watermark(&layer, &font);
        draw_body(&layer, &font, lines);
    }

    doc.save_to_bytes()
        .map_err(|err| ExportError::Pdf(err.to_string()))
}

/// Wraps each line to `columns`, carrying the line's leading spaces (up to
/// half a line) onto its continuation lines.
pub fn wrap_lines(text: &str, columns: usize) -> Vec<String> {
    let mut wrapped = Vec::new();
    for line in text.lines() {
        let indent_len = line
            .chars()
            .take_while(|c| *c == ' ')
            .take(columns / 2)
            .count();
        let indent = &line[..indent_len];
        let options = textwrap::Options::new(columns).subsequent_indent(indent);
        let pieces = textwrap::wrap(line, options);
        if pieces.is_empty() {
            wrapped.push(String::new());
        }
        wrapped.extend(pieces.into_iter().map(|piece| piece.into_owned()));
    }
    wrapped
}

/// Helvetica is drawn through WinAnsiEncoding; anything outside it would be
/// dropped from the page, so such text fails the export instead.
fn ensure_win_ansi(text: &str) -> Result<(), ExportError> {
    match text.chars().find(|c| !is_win_ansi(*c)) {
        Some(c) => Err(ExportError::Pdf(format!(
            "WinAnsi cannot encode {c:?} (U+{:04X})",
            c as u32
        ))),
        None => Ok(()),
    }
}

fn is_win_ansi(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\t' | ' '..='~' | '\u{A0}'..='\u{FF}')
        || matches!(
            c,
            '€' | '‚' | 'ƒ' | '„' | '…' | '†' | '‡' | 'ˆ' | '‰' | 'Š' | '‹' | 'Œ' | 'Ž' | '‘'
                | '’' | '“' | '”' | '•' | '–' | '—' | '˜' | '™' | 'š' | '›' | 'œ' | 'ž' | 'Ÿ'
        )
}

/// Body starts 120pt below the top of the cover page and 50pt below the top
/// of every later page; a new page begins once the cursor drops under the
/// bottom margin.
pub fn paginate(lines: &[String]) -> Vec<Vec<PlacedLine>> {
    let mut pages = vec![Vec::new()];
    let mut y = PAGE_HEIGHT - 120.0;
    for line in lines {
        if y < BOTTOM_MARGIN {
            pages.push(Vec::new());
            y = PAGE_HEIGHT - 50.0;
        }
        if let Some(page) = pages.last_mut() {
            page.push(PlacedLine {
                y,
                text: line.clone(),
            });
        }
        y -= LINE_HEIGHT;
    }
    pages
}

fn draw_watermark(layer: &PdfLayerReference, font: &IndirectFontRef) {
    layer.begin_text_section();
    layer.set_font(font, 40.0);
    layer.set_fill_color(grey(0.9));
    layer.set_text_matrix(TextMatrix::TranslateRotate(
        Pt(PAGE_WIDTH / 2.0 - 50.0),
        Pt(PAGE_HEIGHT / 2.0),
        45.0,
    ));
    layer.write_text(WATERMARK, font);
    layer.end_text_section();
}

fn draw_body(layer: &PdfLayerReference, font: &IndirectFontRef, lines: &[PlacedLine]) {
    layer.set_fill_color(grey(0.0));
    for line in lines {
        layer.use_text(line.text.as_str(), BODY_SIZE, mm(LEFT), mm(line.y), font);
    }
}

fn grey(level: f32) -> Color {
    Color::Rgb(Rgb::new(level, level, level, None))
}

fn mm(points: f32) -> Mm {
    Mm::from(Pt(points))
}
