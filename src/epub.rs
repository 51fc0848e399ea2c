use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use pulldown_cmark::{Options, Parser};
use zip::write::SimpleFileOptions;

use crate::manuscript::{Manuscript, MatterRecord};
use crate::publish::{OutputFormat, Renderer, chapter_markdown, matter_markdown, part_markdown};

/// EPUB 3 output: one XHTML document per matter record, part and chapter.
#[derive(Debug, Clone)]
pub struct EpubRenderer {
    /// BCP-47 language tag used for EPUB metadata and XHTML documents.
    pub lang: String,
}

impl Default for EpubRenderer {
    fn default() -> Self {
        Self {
            lang: "en".to_string(),
        }
    }
}

impl Renderer for EpubRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Epub
    }

    fn render(&self, manuscript: &Manuscript, out_dir: &Path) -> anyhow::Result<PathBuf> {
        let path = out_dir.join(self.format().file_name());
        write_epub(manuscript, &path, &self.lang)?;
        Ok(path)
    }
}

#[derive(Debug)]
struct Document {
    stem: String,
    title: String,
    md: String,
}

#[derive(Debug)]
struct NavItem {
    stem: String,
    title: String,
    children: Vec<NavItem>,
}

/// Spine documents in reading order plus the nested navigation tree.
fn collect_documents(manuscript: &Manuscript) -> (Vec<Document>, Vec<NavItem>) {
    let mut docs = Vec::new();
    let mut nav = Vec::new();

    push_matter(&mut docs, &mut nav, "front", &manuscript.front_matter);

    for part in &manuscript.parts {
        let children = part
            .chapters
            .iter()
            .map(|chapter| NavItem {
                stem: chapter.id.clone(),
                title: chapter.title.clone(),
                children: Vec::new(),
            })
            .collect();
        nav.push(NavItem {
            stem: part.id.clone(),
            title: part.title.clone(),
            children,
        });
        docs.push(Document {
            stem: part.id.clone(),
            title: part.title.clone(),
            md: part_markdown(part),
        });
        for chapter in &part.chapters {
            docs.push(Document {
                stem: chapter.id.clone(),
                title: chapter.title.clone(),
                md: chapter_markdown(chapter),
            });
        }
    }

    push_matter(&mut docs, &mut nav, "back", &manuscript.back_matter);
    (docs, nav)
}

fn push_matter(
    docs: &mut Vec<Document>,
    nav: &mut Vec<NavItem>,
    prefix: &str,
    records: &[MatterRecord],
) {
    for (idx, record) in records.iter().enumerate() {
        if !record.is_present() {
            continue;
        }
        let stem = format!("{prefix}{:02}", idx + 1);
        nav.push(NavItem {
            stem: stem.clone(),
            title: record.title.clone(),
            children: Vec::new(),
        });
        docs.push(Document {
            stem,
            title: record.title.clone(),
            md: matter_markdown(record),
        });
    }
}

/// Writes `manuscript` as an EPUB 3 archive at `out_path`.
pub fn write_epub(manuscript: &Manuscript, out_path: &Path, lang: &str) -> anyhow::Result<()> {
    let (docs, nav) = collect_documents(manuscript);
    if docs.is_empty() {
        anyhow::bail!("manuscript has nothing to render");
    }
    let lang = match lang.trim() {
        "" => "en",
        tag => tag,
    };
    let book = BookMeta {
        title: &manuscript.title,
        subtitle: manuscript.subtitle.as_deref(),
        lang,
        id: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
        modified: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    };

    if let Some(dir) = out_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("create directory for {}", out_path.display()))?;
    }
    let file =
        File::create(out_path).with_context(|| format!("create {}", out_path.display()))?;
    let mut archive = EpubArchive::new(file);

    // Readers sniff the first entry; it has to be the stored mimetype.
    archive.add("mimetype", zip::CompressionMethod::Stored, MIMETYPE)?;
    archive.add_deflated("META-INF/container.xml", CONTAINER_XML)?;
    archive.add_deflated("OEBPS/content.opf", &package_document(&book, &docs))?;
    archive.add_deflated("OEBPS/nav.xhtml", &nav_document(&book, &nav))?;
    archive.add_deflated("OEBPS/toc.ncx", &ncx_document(&book, &docs))?;
    archive.add_deflated("OEBPS/style.css", STYLESHEET)?;
    for doc in &docs {
        let body = ensure_xhtml_void_tags(&markdown_to_html(&doc.md));
        archive.add_deflated(
            &format!("OEBPS/{}.xhtml", doc.stem),
            &content_document(&doc.title, lang, &body),
        )?;
    }
    archive.finish()?;

    tracing::debug!(documents = docs.len(), path = %out_path.display(), "epub written");
    Ok(())
}

const MIMETYPE: &str = "application/epub+zip";

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

const STYLESHEET: &str = r#"@charset "utf-8";

body { font-family: Georgia, serif; margin: 0 1em; line-height: 1.5; }
h1, h2 { page-break-before: always; }
h3 { margin-top: 1.6em; }
blockquote { margin: 1em 1.5em; font-style: italic; }
"#;

struct BookMeta<'a> {
    title: &'a str,
    subtitle: Option<&'a str>,
    lang: &'a str,
    id: String,
    modified: String,
}

struct EpubArchive {
    zip: zip::ZipWriter<File>,
}

impl EpubArchive {
    fn new(file: File) -> Self {
        Self {
            zip: zip::ZipWriter::new(file),
        }
    }

    fn add(
        &mut self,
        name: &str,
        method: zip::CompressionMethod,
        body: &str,
    ) -> anyhow::Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .unix_permissions(0o644);
        self.zip
            .start_file(name, options)
            .with_context(|| format!("add epub entry {name}"))?;
        self.zip
            .write_all(body.as_bytes())
            .with_context(|| format!("write epub entry {name}"))?;
        Ok(())
    }

    fn add_deflated(&mut self, name: &str, body: &str) -> anyhow::Result<()> {
        self.add(name, zip::CompressionMethod::Deflated, body)
    }

    fn finish(self) -> anyhow::Result<()> {
        self.zip.finish().context("finalize epub archive")?;
        Ok(())
    }
}

fn xhtml_head(out: &mut String, title: &str, lang: &str, ops_namespace: bool) {
    let lang = xml_escape(lang);
    let ops = if ops_namespace {
        r#" xmlns:epub="http://www.idpf.org/2007/ops""#
    } else {
        ""
    };
    let _ = write!(
        out,
        r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml"{ops} lang="{lang}" xml:lang="{lang}">
<head>
  <title>{title}</title>
  <meta charset="utf-8" />
  <link rel="stylesheet" type="text/css" href="style.css" />
</head>
<body>
"#,
        title = xml_escape(title),
    );
}

fn content_document(title: &str, lang: &str, body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 512);
    xhtml_head(&mut out, title, lang, false);
    out.push_str(body.trim_end());
    out.push_str("\n</body>\n</html>\n");
    out
}

fn nav_document(book: &BookMeta<'_>, nav: &[NavItem]) -> String {
    let mut out = String::new();
    xhtml_head(&mut out, book.title, book.lang, true);
    let _ = writeln!(out, "  <h1>{}</h1>", xml_escape(book.title));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    nav_list(&mut out, nav, 2);
    out.push_str("  </nav>\n</body>\n</html>\n");
    out
}

fn nav_list(out: &mut String, items: &[NavItem], depth: usize) {
    let pad = "  ".repeat(depth);
    let _ = writeln!(out, "{pad}<ol>");
    for item in items {
        let link = format!(
            r#"<a href="{}.xhtml">{}</a>"#,
            xml_escape(&item.stem),
            xml_escape(&item.title)
        );
        if item.children.is_empty() {
            let _ = writeln!(out, "{pad}  <li>{link}</li>");
            continue;
        }
        let _ = writeln!(out, "{pad}  <li>{link}");
        nav_list(out, &item.children, depth + 2);
        let _ = writeln!(out, "{pad}  </li>");
    }
    let _ = writeln!(out, "{pad}</ol>");
}

/// EPUB 2 table of contents for older readers. Flat, in spine order.
fn ncx_document(book: &BookMeta<'_>, docs: &[Document]) -> String {
    let mut points = String::new();
    for (order, doc) in (1..).zip(docs) {
        let _ = write!(
            points,
            r#"    <navPoint id="np{order}" playOrder="{order}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{stem}.xhtml" />
    </navPoint>
"#,
            label = xml_escape(&doc.title),
            stem = xml_escape(&doc.stem),
        );
    }
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE ncx PUBLIC "-//NISO//DTD ncx 2005-1//EN" "http://www.daisy.org/z3986/2005/ncx-2005-1.dtd">
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{id}" />
    <meta name="dtb:depth" content="1" />
  </head>
  <docTitle><text>{title}</text></docTitle>
  <navMap>
{points}  </navMap>
</ncx>
"#,
        id = xml_escape(&book.id),
        title = xml_escape(book.title),
    )
}

fn package_document(book: &BookMeta<'_>, docs: &[Document]) -> String {
    let description = book
        .subtitle
        .map(|s| format!("    <dc:description>{}</dc:description>\n", xml_escape(s)))
        .unwrap_or_default();
    let mut manifest = String::new();
    let mut spine = String::new();
    for doc in docs {
        let stem = xml_escape(&doc.stem);
        let _ = writeln!(
            manifest,
            r#"    <item id="{stem}" href="{stem}.xhtml" media-type="application/xhtml+xml" />"#
        );
        let _ = writeln!(spine, r#"    <itemref idref="{stem}" />"#);
    }
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="book-id" xml:lang="{lang}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">{id}</dc:identifier>
    <dc:title>{title}</dc:title>
{description}    <dc:language>{lang}</dc:language>
    <meta property="dcterms:modified">{modified}</meta>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav" />
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml" />
    <item id="style" href="style.css" media-type="text/css" />
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        lang = xml_escape(book.lang),
        id = xml_escape(&book.id),
        title = xml_escape(book.title),
        modified = xml_escape(&book.modified),
    )
}

fn markdown_to_html(md: &str) -> String {
    let options = Options::ENABLE_TABLES | Options::ENABLE_FOOTNOTES | Options::ENABLE_STRIKETHROUGH;
    let mut html = String::with_capacity(md.len() * 3 / 2);
    pulldown_cmark::html::push_html(&mut html, Parser::new_ext(md, options));
    html
}

const VOID_ELEMENTS: [&str; 13] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Closes void elements (`<br>` becomes `<br />`) so documents parse as XML.
/// Quoted attribute values may contain `>`.
fn ensure_xhtml_void_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() + 16);
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tag = &rest[open..];
        let Some(close) = tag_end(tag) else {
            out.push_str(tag);
            return out;
        };
        let inner = &tag[..close];
        let name = inner[1..]
            .split(|c: char| !c.is_ascii_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        out.push_str(inner);
        if VOID_ELEMENTS.contains(&name.as_str()) && !inner.trim_end().ends_with('/') {
            out.push_str(" />");
        } else {
            out.push('>');
        }
        rest = &tag[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Byte offset of the `>` closing the tag that starts `tag`.
fn tag_end(tag: &str) -> Option<usize> {
    let mut quote = None;
    for (idx, ch) in tag.char_indices().skip(1) {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '>') => return Some(idx),
            (None, _) => {}
        }
    }
    None
}

fn xml_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;
    use crate::manuscript::tests::sample_manuscript;
    use crate::manuscript::MatterKind;

    fn read_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> anyhow::Result<String> {
        let mut entry = archive.by_name(name)?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        Ok(text)
    }

    #[test]
    fn ensure_xhtml_void_tags_preserves_utf8_text() {
        let input = "<p>日本語のテスト</p><br><hr/><img src=\"a>b.png\">";
        let out = ensure_xhtml_void_tags(input);
        assert_eq!(
            out,
            "<p>日本語のテスト</p><br /><hr/><img src=\"a>b.png\" />"
        );
    }

    #[test]
    fn renders_nested_navigation_and_documents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manuscript = sample_manuscript();
        manuscript.title = "Fish & Chips".to_owned();
        for section in manuscript.sections_mut() {
            section.content = "Line one  \nline two.".to_owned();
        }
        let mut preface = MatterRecord::new(MatterKind::Preface, "Preface", 10);
        preface.content = "Why.".to_owned();
        manuscript.front_matter = vec![
            preface,
            MatterRecord::new(MatterKind::Introduction, "Introduction", 10),
        ];

        let path = EpubRenderer::default().render(&manuscript, dir.path())?;
        assert!(path.ends_with("book.epub"));

        let mut archive = zip::ZipArchive::new(File::open(&path)?)?;
        assert_eq!(archive.by_index(0)?.name(), "mimetype");

        let nav = read_entry(&mut archive, "OEBPS/nav.xhtml")?;
        assert!(nav.contains("<h1>Fish &amp; Chips</h1>"));
        assert!(nav.contains("<a href=\"front01.xhtml\">Preface</a>"));
        assert!(!nav.contains("front02"));
        let part = nav.find("pt01.xhtml").unwrap_or(usize::MAX);
        let chapter = nav.find("ch01.xhtml").unwrap_or(0);
        assert!(part < chapter);
        assert_eq!(nav.matches("<ol>").count(), 3);

        let chapter = read_entry(&mut archive, "OEBPS/ch01.xhtml")?;
        assert!(chapter.contains("<h2>Chapter One</h2>"));
        assert!(chapter.contains("<br />"));

        let opf = read_entry(&mut archive, "OEBPS/content.opf")?;
        assert_eq!(opf.matches("<itemref").count(), 1 + 2 + 3);
        Ok(())
    }
}
