//! EPUB container access.
//!
//! Loads every archive entry into memory, finds the content documents via
//! `META-INF/container.xml` and the package document's manifest, and writes
//! the archive back out with only the document entries changed.

use crate::error::EpubError;
use log::{debug, warn};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const CONTAINER_PATH: &str = "META-INF/container.xml";
const MIMETYPE_PATH: &str = "mimetype";
const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";

/// Manifest media types treated as translatable content documents.
const DOCUMENT_MEDIA_TYPES: &[&str] = &["application/xhtml+xml", "text/html"];

/// One archive entry, held in memory.
#[derive(Debug, Clone)]
struct Entry {
    name: String,
    data: Vec<u8>,
    compression: CompressionMethod,
    is_dir: bool,
}

/// A content document listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Manifest item id.
    pub id: String,
    /// Path of the entry inside the archive.
    pub path: String,
    /// Manifest media type.
    pub media_type: String,
    entry: usize,
    content: Vec<u8>,
}

impl Document {
    /// The document's markup.
    pub fn raw_markup(&self) -> Result<String, EpubError> {
        let text = std::str::from_utf8(&self.content)
            .map_err(|_| EpubError::Format(format!("{} is not valid UTF-8", self.path)))?;
        Ok(text.trim_start_matches('\u{feff}').to_string())
    }

    /// Replaces the document's markup.
    pub fn set_raw_markup(&mut self, markup: String) {
        self.content = markup.into_bytes();
    }
}

/// An EPUB archive loaded into memory.
#[derive(Debug)]
pub struct EpubContainer {
    entries: Vec<Entry>,
    documents: Vec<Document>,
}

impl EpubContainer {
    /// Opens the EPUB at `path`.
    pub fn load(path: &Path) -> Result<Self, EpubError> {
        if !path.is_file() {
            return Err(EpubError::NotFound(path.to_path_buf()));
        }
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Reads an EPUB from raw archive bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EpubError> {
        let mut archive = ZipArchive::new(Cursor::new(data))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let mut data = Vec::new();
            if !file.is_dir() {
                file.read_to_end(&mut data)?;
            }
            entries.push(Entry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                is_dir: file.is_dir(),
            });
        }

        let container_xml = entry_text(&entries, CONTAINER_PATH)
            .ok_or_else(|| EpubError::Format(format!("missing {}", CONTAINER_PATH)))?;
        let opf_path = find_opf_path(&container_xml)?;
        let opf = entry_text(&entries, &opf_path)
            .ok_or_else(|| EpubError::Format(format!("package document {} not found", opf_path)))?;
        let opf_dir = opf_path
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();

        let mut documents = Vec::new();
        for item in manifest_documents(&opf)? {
            let path = resolve_href(&opf_dir, &item.href);
            let Some(entry) = entries.iter().position(|e| !e.is_dir && e.name == path) else {
                warn!("manifest item {} points at missing entry {}", item.id, path);
                continue;
            };
            if documents.iter().any(|d: &Document| d.entry == entry) {
                continue;
            }
            documents.push(Document {
                id: item.id,
                path,
                media_type: item.media_type,
                entry,
                content: std::mem::take(&mut entries[entry].data),
            });
        }

        debug!(
            "loaded EPUB: {} entries, {} content documents, package at {}",
            entries.len(),
            documents.len(),
            opf_path
        );

        Ok(Self {
            entries,
            documents,
        })
    }

    /// Content documents in manifest order.
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Number of content documents.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// The content document at `index`.
    pub fn document(&self, index: usize) -> Option<&Document> {
        self.documents.get(index)
    }

    /// Mutable access to the content document at `index`.
    pub fn document_mut(&mut self, index: usize) -> Option<&mut Document> {
        self.documents.get_mut(index)
    }

    /// Writes the archive to `path`.
    ///
    /// The archive is written to a temporary file next to `path` and moved
    /// into place, so a failed save never leaves a partial file behind.
    /// `mimetype` is always the first entry and stored uncompressed.
    pub fn save(&self, path: &Path) -> Result<(), EpubError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

        {
            let mut zip = ZipWriter::new(tmp.as_file_mut());
            let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

            let mimetype = self
                .entries
                .iter()
                .find(|e| e.name == MIMETYPE_PATH)
                .map(|e| e.data.as_slice())
                .unwrap_or(EPUB_MIMETYPE);
            zip.start_file(MIMETYPE_PATH, stored)?;
            zip.write_all(mimetype)?;

            for (index, entry) in self.entries.iter().enumerate() {
                if entry.name == MIMETYPE_PATH {
                    continue;
                }
                let method = match entry.compression {
                    CompressionMethod::Stored => CompressionMethod::Stored,
                    _ => CompressionMethod::Deflated,
                };
                let options = SimpleFileOptions::default().compression_method(method);
                if entry.is_dir {
                    zip.add_directory(entry.name.as_str(), options)?;
                } else {
                    let data = self
                        .documents
                        .iter()
                        .find(|d| d.entry == index)
                        .map(|d| d.content.as_slice())
                        .unwrap_or(&entry.data);
                    zip.start_file(entry.name.as_str(), options)?;
                    zip.write_all(data)?;
                }
            }

            zip.finish()?;
        }

        tmp.persist(path).map_err(|e| EpubError::Io(e.error))?;
        debug!("saved EPUB to {}", path.display());
        Ok(())
    }
}

/// A manifest item that is a content document.
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
}

fn entry_text(entries: &[Entry], name: &str) -> Option<String> {
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| String::from_utf8_lossy(&e.data).trim_start_matches('\u{feff}').to_string())
}

fn parse_xml(text: &str) -> Result<roxmltree::Document<'_>, EpubError> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    roxmltree::Document::parse_with_options(text, options)
        .map_err(|e| EpubError::Xml(e.to_string()))
}

/// Reads the package document path from `container.xml`.
fn find_opf_path(container_xml: &str) -> Result<String, EpubError> {
    let doc = parse_xml(container_xml)?;
    doc.descendants()
        .find(|n| n.has_tag_name("rootfile"))
        .and_then(|n| n.attribute("full-path"))
        .map(|p| p.trim_start_matches('/').to_string())
        .ok_or_else(|| EpubError::Format("container.xml has no rootfile".to_string()))
}

/// Content documents of the manifest, in manifest order.
fn manifest_documents(opf: &str) -> Result<Vec<ManifestItem>, EpubError> {
    let doc = parse_xml(opf)?;
    let manifest = doc
        .descendants()
        .find(|n| n.has_tag_name("manifest"))
        .ok_or_else(|| EpubError::Format("package document has no manifest".to_string()))?;

    Ok(manifest
        .children()
        .filter(|n| n.has_tag_name("item"))
        .filter_map(|n| {
            let media_type = n.attribute("media-type")?;
            if !DOCUMENT_MEDIA_TYPES.contains(&media_type) {
                return None;
            }
            Some(ManifestItem {
                id: n.attribute("id").unwrap_or_default().to_string(),
                href: n.attribute("href")?.to_string(),
                media_type: media_type.to_string(),
            })
        })
        .collect())
}

/// Resolves a manifest href against the package document's directory.
fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let href = urlencoding::decode(href)
        .map(|h| h.into_owned())
        .unwrap_or_else(|_| href.to_string());

    let mut segments: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    /// Builds EPUB bytes with the given `(href, markup)` content documents
    /// under `OEBPS/`, plus a stylesheet and an image.
    pub fn build_epub(documents: &[(&str, &str)]) -> Vec<u8> {
        let mut items = String::new();
        for (i, (href, _)) in documents.iter().enumerate() {
            items.push_str(&format!(
                r#"    <item id="doc{}" href="{}" media-type="application/xhtml+xml"/>
"#,
                i, href
            ));
        }
        let opf = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">test-book</dc:identifier>
    <dc:title>Test Book</dc:title>
  </metadata>
  <manifest>
    <item id="css" href="style.css" media-type="text/css"/>
    <item id="cover" href="images/cover.png" media-type="image/png"/>
{}  </manifest>
  <spine/>
</package>"#,
            items
        );

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(MIMETYPE_PATH, stored).unwrap();
        zip.write_all(EPUB_MIMETYPE).unwrap();
        zip.add_directory("META-INF/", stored).unwrap();
        zip.start_file(CONTAINER_PATH, deflated).unwrap();
        zip.write_all(CONTAINER_XML.as_bytes()).unwrap();
        zip.start_file("OEBPS/content.opf", deflated).unwrap();
        zip.write_all(opf.as_bytes()).unwrap();
        zip.start_file("OEBPS/style.css", deflated).unwrap();
        zip.write_all(b"p { margin: 0; }").unwrap();
        zip.start_file("OEBPS/images/cover.png", stored).unwrap();
        zip.write_all(&[0x89, b'P', b'N', b'G', 0, 1, 2, 3]).unwrap();
        for (href, markup) in documents {
            zip.start_file(resolve_href("OEBPS", href), deflated).unwrap();
            zip.write_all(markup.as_bytes()).unwrap();
        }

        zip.finish().unwrap().into_inner()
    }

    /// Wraps body markup in a minimal XHTML document.
    pub fn xhtml(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\">\n<head><title>t</title></head>\n{}\n</html>\n",
            body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{build_epub, xhtml};
    use super::*;
    use tempfile::TempDir;

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = ZipArchive::new(Cursor::new(data)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn read_entry(data: &[u8], name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(Cursor::new(data)).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_documents_in_manifest_order() {
        let one = xhtml("<body><p>One</p></body>");
        let two = xhtml("<body><p>Two</p></body>");
        let data = build_epub(&[("text/ch2.xhtml", &two), ("ch1.xhtml", &one)]);
        let epub = EpubContainer::from_bytes(&data).unwrap();

        let paths: Vec<&str> = epub.documents().iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["OEBPS/text/ch2.xhtml", "OEBPS/ch1.xhtml"]);
        assert_eq!(epub.document_count(), 2);
        assert_eq!(epub.documents()[0].id, "doc0");
        assert_eq!(epub.documents()[0].media_type, "application/xhtml+xml");
        let ch1 = epub.document(1).unwrap();
        assert!(ch1.raw_markup().unwrap().contains("<p>One</p>"));
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(resolve_href("OEBPS", "ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/text", "../ch1.xhtml#s1"), "OEBPS/ch1.xhtml");
        assert_eq!(resolve_href("", "./a%20b.xhtml"), "a b.xhtml");
        assert_eq!(resolve_href("OEBPS", "/root.xhtml"), "root.xhtml");
    }

    #[test]
    fn test_missing_container_xml_is_rejected() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("mimetype", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(EPUB_MIMETYPE).unwrap();
        let data = zip.finish().unwrap().into_inner();

        assert!(matches!(
            EpubContainer::from_bytes(&data),
            Err(EpubError::Format(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.epub");
        assert!(matches!(
            EpubContainer::load(&missing),
            Err(EpubError::NotFound(_))
        ));
    }

    #[test]
    fn test_save_preserves_other_entries() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.epub");
        let output = dir.path().join("out.epub");
        let original = xhtml("<body><p>Hello</p></body>");
        let source = build_epub(&[("ch1.xhtml", &original)]);
        std::fs::write(&input, &source).unwrap();

        let mut epub = EpubContainer::load(&input).unwrap();
        let doc = epub.document_mut(0).unwrap();
        let translated = doc.raw_markup().unwrap().replace("Hello", "Ciao");
        doc.set_raw_markup(translated);
        epub.save(&output).unwrap();

        let saved = std::fs::read(&output).unwrap();
        assert_eq!(entry_names(&saved), entry_names(&source));
        assert_eq!(entry_names(&saved)[0], "mimetype");

        let mut archive = ZipArchive::new(Cursor::new(saved.as_slice())).unwrap();
        assert_eq!(
            archive.by_index(0).unwrap().compression(),
            CompressionMethod::Stored
        );

        for name in ["OEBPS/style.css", "OEBPS/images/cover.png", "OEBPS/content.opf"] {
            assert_eq!(read_entry(&saved, name), read_entry(&source, name));
        }
        let doc = String::from_utf8(read_entry(&saved, "OEBPS/ch1.xhtml")).unwrap();
        assert!(doc.contains("<p>Ciao</p>"));

        // Only the two archives remain; the temp file was moved into place
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_document_out_of_range() {
        let data = build_epub(&[("ch1.xhtml", "<html><body/></html>")]);
        let mut epub = EpubContainer::from_bytes(&data).unwrap();
        assert!(epub.document(5).is_none());
        assert!(epub.document_mut(5).is_none());
    }

    #[test]
    fn test_invalid_utf8_document() {
        let data = build_epub(&[("ch1.xhtml", "<html><body/></html>")]);
        let mut epub = EpubContainer::from_bytes(&data).unwrap();
        let doc = epub.document_mut(0).unwrap();
        doc.content = vec![0xff, 0xfe, 0x00];
        assert!(matches!(doc.raw_markup(), Err(EpubError::Format(_))));
    }
}
