//! DOCX Template Rendering
//!
//! Templates are read and written with `docx-rs`. Placeholders are `{{ key }}`
//! inside the text runs of body paragraphs, table cells included. A placeholder
//! that a word processor split over several runs is first gathered into the
//! run where it starts, which keeps that run's formatting. Image slots become
//! inline pictures sized to the context's width.
//!
//! Rendering is all-or-nothing: every placeholder in the template must have a
//! value, and every field of the contract must appear in the template.

use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use docx_rs::{
    read_docx, BreakType, DocumentChild, Paragraph, ParagraphChild, Pic, Run, RunChild, Table,
    TableCellContent, TableChild, TableRowChild,
};

use crate::context::{FieldValue, ReportContext, IMAGES, TEXT_FIELDS};
use crate::error::ReportError;

pub const DOCX_MEDIA_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const EMU_PER_MM: f64 = 36_000.0;

/// Render the template at `template` with `ctx`, returning the package bytes.
pub fn render(template: &Path, ctx: &ReportContext) -> Result<Vec<u8>, ReportError> {
    let bytes = fs::read(template)
        .map_err(|e| ReportError::RenderFailed(format!("cannot read template: {e}")))?;
    render_bytes(&bytes, ctx)
}

pub fn render_bytes(template: &[u8], ctx: &ReportContext) -> Result<Vec<u8>, ReportError> {
    ctx.check_complete()?;

    let mut docx = read_docx(template).map_err(|e| {
        ReportError::RenderFailed(format!("template is not a readable DOCX package: {e:?}"))
    })?;

    let pictures = load_pictures(ctx)?;
    let mut state = RenderState {
        ctx,
        pictures: &pictures,
        seen: BTreeSet::new(),
        next_paragraph: 1,
        next_picture: 1,
    };
    for child in docx.document.children.iter_mut() {
        match child {
            DocumentChild::Paragraph(para) => state.paragraph(para)?,
            DocumentChild::Table(table) => state.table(table)?,
            _ => {}
        }
    }

    let missing: Vec<&str> = TEXT_FIELDS
        .iter()
        .chain(IMAGES.iter())
        .filter(|k| !state.seen.contains(**k))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(ReportError::RenderFailed(format!(
            "template is missing placeholders: {}",
            missing.join(", ")
        )));
    }

    let mut out = Cursor::new(Vec::new());
    docx.build()
        .pack(&mut out)
        .map_err(|e| ReportError::RenderFailed(format!("writing package: {e}")))?;
    Ok(out.into_inner())
}

// --- Images ---

struct Picture {
    key: &'static str,
    png: Vec<u8>,
    cx: u32,
    cy: u32,
}

fn load_pictures(ctx: &ReportContext) -> Result<Vec<Picture>, ReportError> {
    let mut pictures = Vec::with_capacity(IMAGES.len());
    for key in IMAGES {
        let Some(FieldValue::Image(inline)) = ctx.get(key) else {
            continue;
        };
        let png = fs::read(&inline.path)
            .map_err(|e| ReportError::RenderFailed(format!("{key}: {e}")))?;
        let (w, h) = image::image_dimensions(&inline.path)
            .map_err(|e| ReportError::RenderFailed(format!("{key}: {e}")))?;
        if w == 0 || h == 0 {
            return Err(ReportError::RenderFailed(format!("{key}: empty image")));
        }
        let cx = (inline.width_mm * EMU_PER_MM).round();
        // Height follows the crop's own aspect ratio, so non-square crops are not stretched.
        let cy = (cx * h as f64 / w as f64).round();
        pictures.push(Picture { key, png, cx: cx as u32, cy: cy as u32 });
    }
    Ok(pictures)
}

// --- Placeholder substitution ---

struct RenderState<'a> {
    ctx: &'a ReportContext,
    pictures: &'a [Picture],
    seen: BTreeSet<String>,
    next_paragraph: u32,
    next_picture: u32,
}

impl RenderState<'_> {
    fn table(&mut self, table: &mut Table) -> Result<(), ReportError> {
        for row in table.rows.iter_mut() {
            let TableChild::TableRow(row) = row;
            for cell in row.cells.iter_mut() {
                let TableRowChild::TableCell(cell) = cell;
                for content in cell.children.iter_mut() {
                    match content {
                        TableCellContent::Paragraph(para) => self.paragraph(para)?,
                        TableCellContent::Table(nested) => self.table(nested)?,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn paragraph(&mut self, para: &mut Paragraph) -> Result<(), ReportError> {
        // Reading assigns ids from a process-wide counter; number them in
        // document order so identical inputs give identical packages.
        para.id = format!("{:08X}", self.next_paragraph);
        self.next_paragraph += 1;

        let mut runs: Vec<&mut Run> = para
            .children
            .iter_mut()
            .filter_map(|c| match c {
                ParagraphChild::Run(run) => Some(&mut **run),
                _ => None,
            })
            .collect();
        let texts: Vec<String> = runs.iter().map(|r| run_text(r)).collect();
        let full = texts.concat();
        if !full.contains("{{") && !full.contains("{%") {
            return Ok(());
        }

        let bounds = gather_placeholders(&texts, &placeholder_spans(&full)?);
        for (k, run) in runs.iter_mut().enumerate() {
            let text = &full[bounds[k]..bounds[k + 1]];
            if text == texts[k] && !text.contains("{{") {
                continue;
            }
            let rendered = self.render_text(text)?;
            replace_text(run, rendered);
        }
        Ok(())
    }

    /// Run children for `text`: literals, values with breaks and tabs, pictures.
    fn render_text(&mut self, text: &str) -> Result<Vec<RunChild>, ReportError> {
        let ctx = self.ctx;
        let mut run = Run::new();
        for segment in parse_segments(text)? {
            match segment {
                Segment::Literal(literal) => run = run.add_text(unescape(literal)),
                Segment::Placeholder(key) => {
                    self.seen.insert(key.to_string());
                    run = match ctx.get(key) {
                        Some(FieldValue::Text(value)) => add_value(run, value),
                        Some(FieldValue::Image(_)) => run.add_image(self.picture(key)?),
                        None => {
                            return Err(ReportError::RenderFailed(format!(
                                "template placeholder '{key}' has no value"
                            )))
                        }
                    };
                }
            }
        }
        Ok(run.children)
    }

    fn picture(&mut self, key: &str) -> Result<Pic, ReportError> {
        let pictures = self.pictures;
        let picture = pictures
            .iter()
            .find(|p| p.key == key)
            .ok_or_else(|| ReportError::RenderFailed(format!("image '{key}' was not loaded")))?;
        let mut pic = Pic::new(&picture.png).size(picture.cx, picture.cy);
        pic.id = format!("rIdLaudoImage{}", self.next_picture);
        self.next_picture += 1;
        Ok(pic)
    }
}

fn run_text(run: &Run) -> String {
    run.children
        .iter()
        .filter_map(|c| match c {
            RunChild::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect()
}

/// Swap the run's text children for `rendered`, at the position of the first
/// one. Properties and non-text children stay.
fn replace_text(run: &mut Run, rendered: Vec<RunChild>) {
    let at = run
        .children
        .iter()
        .position(|c| matches!(c, RunChild::Text(_)))
        .unwrap_or(run.children.len());
    run.children.retain(|c| !matches!(c, RunChild::Text(_)));
    run.children.splice(at..at, rendered);
}

fn add_value(mut run: Run, value: &str) -> Run {
    for (i, line) in value.split('\n').enumerate() {
        if i > 0 {
            run = run.add_break(BreakType::TextWrapping);
        }
        for (j, part) in line.trim_end_matches('\r').split('\t').enumerate() {
            if j > 0 {
                run = run.add_tab();
            }
            if !part.is_empty() {
                run = run.add_text(part);
            }
        }
    }
    run
}

/// Text read from a package is kept entity-escaped; builders escape again.
fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Run boundaries in the concatenated text after moving every placeholder
/// wholly into the run where it starts. `bounds[k]..bounds[k + 1]` is run
/// `k`'s new text.
fn gather_placeholders(texts: &[String], spans: &[(usize, usize)]) -> Vec<usize> {
    let mut bounds = Vec::with_capacity(texts.len() + 1);
    let mut offset = 0;
    for text in texts {
        bounds.push(offset);
        offset += text.len();
    }
    bounds.push(offset);

    let last = texts.len();
    for &(start, end) in spans {
        let Some(owner) = (0..last).find(|&k| bounds[k] <= start && start < bounds[k + 1]) else {
            continue;
        };
        for b in bounds.iter_mut().take(last).skip(owner + 1) {
            if *b < end {
                *b = end;
            }
        }
    }
    bounds
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Byte ranges of every `{{ ... }}` in `text`, delimiters included.
fn placeholder_spans(text: &str) -> Result<Vec<(usize, usize)>, ReportError> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for segment in parse_segments(text)? {
        let len = match segment {
            Segment::Literal(l) => l.len(),
            Segment::Placeholder(_) => {
                let close = text[offset..].find("}}").map_or(text.len(), |c| offset + c + 2);
                spans.push((offset, close));
                close - offset
            }
        };
        offset += len;
    }
    Ok(spans)
}

fn parse_segments(text: &str) -> Result<Vec<Segment<'_>>, ReportError> {
    if text.contains("{%") {
        return Err(ReportError::RenderFailed(
            "template control tags ({% ... %}) are not supported".into(),
        ));
    }
    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Literal(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            ReportError::RenderFailed(format!("unterminated placeholder near '{}'", preview(&rest[open..])))
        })?;
        let key = after[..close].trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ReportError::RenderFailed(format!(
                "unsupported placeholder expression '{{{{{}}}}}'",
                &after[..close]
            )));
        }
        segments.push(Segment::Placeholder(key));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

fn preview(s: &str) -> String {
    s.chars().take(24).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InlineImage;
    use docx_rs::{Docx, TableCell, TableRow};
    use image::{Rgb, RgbImage};
    use std::io::Read;
    use std::path::PathBuf;
    use zip::ZipArchive;

    fn text_paragraph(text: &str) -> Paragraph {
        Paragraph::new().add_run(Run::new().add_text(text))
    }

    fn placeholder(key: &str) -> Paragraph {
        text_paragraph(&format!("{{{{ {key} }}}}"))
    }

    fn template(paragraphs: Vec<Paragraph>) -> Docx {
        paragraphs.into_iter().fold(Docx::new(), Docx::add_paragraph)
    }

    fn full_template() -> Docx {
        template(TEXT_FIELDS.iter().chain(IMAGES.iter()).map(|k| placeholder(k)).collect())
    }

    fn pack(docx: Docx) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        docx.build().pack(&mut out).unwrap();
        out.into_inner()
    }

    fn full_context(dir: &Path) -> ReportContext {
        let mut ctx = ReportContext::new();
        for key in TEXT_FIELDS {
            ctx.set_text(key, format!("v-{key}"));
        }
        for (i, key) in IMAGES.iter().enumerate() {
            let path: PathBuf = dir.join(format!("img{i}.png"));
            RgbImage::from_pixel(40, 20, Rgb([1, 2, 3])).save(&path).unwrap();
            ctx.set(key, FieldValue::Image(InlineImage { path, width_mm: 100.0 }));
        }
        ctx
    }

    fn document_xml(package: &[u8]) -> String {
        let mut archive = ZipArchive::new(Cursor::new(package)).unwrap();
        let mut file = archive.by_name("word/document.xml").unwrap();
        let mut s = String::new();
        file.read_to_string(&mut s).unwrap();
        s
    }

    fn media_count(package: &[u8]) -> usize {
        let archive = ZipArchive::new(Cursor::new(package)).unwrap();
        archive.file_names().filter(|n| n.starts_with("word/media/")).count()
    }

    #[test]
    fn renders_all_fields_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let out = render_bytes(&pack(full_template()), &ctx).unwrap();

        let doc = document_xml(&out);
        assert!(doc.contains("v-patient_name"));
        assert!(doc.contains("v-caption_3"));
        assert!(!doc.contains("{{"));
        assert_eq!(doc.matches("<w:drawing").count(), 3);
        // 100mm wide, 2:1 aspect ratio.
        assert!(doc.contains(r#"cx="3600000" cy="1800000""#));
        assert_eq!(media_count(&out), 3);
    }

    #[test]
    fn same_inputs_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let template = pack(full_template());
        assert_eq!(render_bytes(&template, &ctx).unwrap(), render_bytes(&template, &ctx).unwrap());
    }

    #[test]
    fn missing_placeholder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let paragraphs = TEXT_FIELDS
            .iter()
            .chain(IMAGES.iter())
            .filter(|k| **k != "full_reference")
            .map(|k| placeholder(k))
            .collect();
        let err = render_bytes(&pack(template(paragraphs)), &ctx).unwrap_err();
        assert!(matches!(err, ReportError::RenderFailed(ref m) if m.contains("full_reference")));
    }

    #[test]
    fn unknown_placeholder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let docx = full_template().add_paragraph(placeholder("signature"));
        let err = render_bytes(&pack(docx), &ctx).unwrap_err();
        assert!(matches!(err, ReportError::RenderFailed(ref m) if m.contains("signature")));
    }

    #[test]
    fn unterminated_placeholder_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let docx = full_template().add_paragraph(text_paragraph("{{ patient_name"));
        assert!(matches!(render_bytes(&pack(docx), &ctx), Err(ReportError::RenderFailed(_))));
    }

    #[test]
    fn not_a_package_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        assert!(matches!(
            render_bytes(b"plain text", &ctx),
            Err(ReportError::RenderFailed(_))
        ));
    }

    #[test]
    fn placeholder_split_across_runs_keeps_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let split = Paragraph::new()
            .add_run(Run::new().add_text("Nome: {{ pat").bold())
            .add_run(Run::new().add_text("ient_name }} fim"));
        let paragraphs = std::iter::once(split)
            .chain(TEXT_FIELDS.iter().chain(IMAGES.iter()).skip(1).map(|k| placeholder(k)))
            .collect();

        let doc = document_xml(&render_bytes(&pack(template(paragraphs)), &ctx).unwrap());
        assert!(doc.contains("Nome: v-patient_name"));
        assert!(doc.contains(" fim"));
        assert!(!doc.contains("ient_name"));
    }

    #[test]
    fn gather_moves_only_split_placeholders() {
        let texts = vec!["a {{ x".to_string(), " }} b".to_string(), "{{ y }}".to_string()];
        let full = texts.concat();
        let spans = placeholder_spans(&full).unwrap();
        assert_eq!(spans, vec![(2, 9), (11, 18)]);
        let bounds = gather_placeholders(&texts, &spans);
        assert_eq!(&full[bounds[0]..bounds[1]], "a {{ x }}");
        assert_eq!(&full[bounds[1]..bounds[2]], " b");
        assert_eq!(&full[bounds[2]..bounds[3]], "{{ y }}");
    }

    #[test]
    fn placeholders_in_table_cells() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = full_context(dir.path());
        let paragraphs = TEXT_FIELDS
            .iter()
            .chain(IMAGES.iter())
            .filter(|k| **k != "caption_1" && **k != "image_1")
            .map(|k| placeholder(k))
            .collect();
        let row = TableRow::new(vec![
            TableCell::new().add_paragraph(placeholder("image_1")),
            TableCell::new().add_paragraph(placeholder("caption_1")),
        ]);
        let docx = template(paragraphs).add_table(Table::new(vec![row]));

        let out = render_bytes(&pack(docx), &ctx).unwrap();
        let doc = document_xml(&out);
        assert!(doc.contains("v-caption_1"));
        assert_eq!(doc.matches("<w:drawing").count(), 3);
    }

    #[test]
    fn values_are_escaped_and_broken() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = full_context(dir.path());
        ctx.set_text("conclusion", "A & <B>\nC\tD");
        let doc = document_xml(&render_bytes(&pack(full_template()), &ctx).unwrap());
        assert!(doc.contains("A &amp; &lt;B&gt;"));
        assert!(doc.contains("<w:br"));
        assert!(doc.contains("<w:tab"));
    }

    #[test]
    fn literal_text_is_not_double_escaped() {
        assert_eq!(unescape("5 &lt; 6 &amp;&amp; x"), "5 < 6 && x");
        assert_eq!(unescape("&amp;lt;"), "&lt;");
    }

    #[test]
    fn control_tags_rejected() {
        assert!(parse_segments("{% for x in y %}").is_err());
        assert!(parse_segments("{{ a|upper }}").is_err());
        assert_eq!(
            parse_segments("x {{a}} y").unwrap(),
            vec![Segment::Literal("x "), Segment::Placeholder("a"), Segment::Literal(" y")]
        );
    }
}
