//! hOCR structured-layout emission.
//!
//! hOCR represents OCR output as XHTML with `title="bbox x0 y0 x1 y1"`
//! attributes in absolute pixels. We only ever emit it (never parse it
//! back), so this module is a one-way converter from normalized bounding
//! boxes plus page pixel dimensions to an XML string.

use std::sync::Mutex;

use quick_xml::{Writer, events::{BytesEnd, BytesStart, BytesText, Event}};

use crate::prelude::*;

/// A word or paragraph's normalized bounding box: each coordinate is a
/// fraction of the page's width or height, in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedBBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl NormalizedBBox {
    /// Convert to absolute pixel coordinates given the page's dimensions,
    /// producing the `bbox x0 y0 x1 y1` string hOCR expects.
    pub fn to_pixel_bbox(self, page_width: u32, page_height: u32) -> String {
        let x0 = (self.x0 * page_width as f64).round() as i64;
        let y0 = (self.y0 * page_height as f64).round() as i64;
        let x1 = (self.x1 * page_width as f64).round() as i64;
        let y1 = (self.y1 * page_height as f64).round() as i64;
        format!("bbox {x0} {y0} {x1} {y1}")
    }
}

/// One paragraph detected on a page: its bounding box and constituent
/// words. We treat the whole paragraph's text as a single `ocrx_word` run
/// when the provider doesn't give us word-level boxes, since the
/// specification's only worked example is paragraph-level.
#[derive(Debug, Clone)]
pub struct Paragraph {
    pub bbox: NormalizedBBox,
    pub text: String,
}

/// Render one page's paragraphs as an hOCR `ocr_page` XML fragment.
pub fn render_page(
    page_number: u32,
    page_width: u32,
    page_height: u32,
    paragraphs: &[Paragraph],
) -> Result<String> {
    let mut writer = Writer::new(Vec::new());

    let mut page_start = BytesStart::new("div");
    page_start.push_attribute(("class", "ocr_page"));
    page_start.push_attribute(("id", format!("page_{page_number}").as_str()));
    page_start.push_attribute((
        "title",
        format!("bbox 0 0 {page_width} {page_height}").as_str(),
    ));
    writer.write_event(Event::Start(page_start))?;

    for paragraph in paragraphs {
        let bbox = paragraph.bbox.to_pixel_bbox(page_width, page_height);

        let mut par_start = BytesStart::new("p");
        par_start.push_attribute(("class", "ocr_par"));
        par_start.push_attribute(("title", bbox.as_str()));
        writer.write_event(Event::Start(par_start))?;

        let mut word_start = BytesStart::new("span");
        word_start.push_attribute(("class", "ocrx_word"));
        word_start.push_attribute(("title", bbox.as_str()));
        writer.write_event(Event::Start(word_start))?;
        writer.write_event(Event::Text(BytesText::new(&paragraph.text)))?;
        writer.write_event(Event::End(BytesEnd::new("span")))?;

        writer.write_event(Event::End(BytesEnd::new("p")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("div")))?;

    let bytes = writer.into_inner();
    String::from_utf8(bytes).context("hOCR writer produced invalid UTF-8")
}

/// Thread-safe accumulator of hOCR page fragments for one job. Google
/// Document AI is the one variant in this crate that can produce hOCR;
/// page results may be appended out of order by concurrent workers when
/// per-page parallelism is enabled, so appends are mutex-protected and
/// the final document is reassembled in page order at flush time.
#[derive(Default)]
pub struct HocrAccumulator {
    pages: Mutex<Vec<(u32, String)>>,
}

impl HocrAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one page's rendered fragment.
    pub fn append(&self, page_number: u32, fragment: String) {
        let mut pages = self.pages.lock().expect("hOCR accumulator lock poisoned");
        pages.push((page_number, fragment));
    }

    /// Render the full hOCR document, with pages in page-number order
    /// regardless of append order.
    pub fn finalize(&self) -> String {
        let mut pages = self.pages.lock().expect("hOCR accumulator lock poisoned").clone();
        pages.sort_by_key(|(page_number, _)| *page_number);
        let body: String = pages.into_iter().map(|(_, fragment)| fragment).collect();
        wrap_document(&body)
    }
}

/// Wrap already-rendered `ocr_page` fragments in the full hOCR document
/// envelope (XML declaration, DOCTYPE, `html`/`body`). Shared by
/// [`HocrAccumulator::finalize`] and the job manager's `hocr_output_path`
/// file write, which has its own page fragments (one job's worth, not an
/// accumulator) to wrap.
pub fn wrap_document(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Transitional//EN\" \
         \"http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd\">\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\">\n<body>\n{body}\n</body>\n</html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_hello_world_bbox() {
        // The specification's concrete hOCR scenario: a paragraph "Hello
        // World" at normalized bbox (0.1,0.1)-(0.9,0.2) on an 800x600 page
        // must emit ocr_par bbox "80 60 720 120".
        let bbox = NormalizedBBox {
            x0: 0.1,
            y0: 0.1,
            x1: 0.9,
            y1: 0.2,
        };
        assert_eq!(bbox.to_pixel_bbox(800, 600), "bbox 80 60 720 120");

        let xml = render_page(
            1,
            800,
            600,
            &[Paragraph {
                bbox,
                text: "Hello World".to_owned(),
            }],
        )
        .unwrap();
        assert!(xml.contains("ocr_par"));
        assert!(xml.contains("bbox 80 60 720 120"));
        assert!(xml.contains("Hello World"));
    }

    #[test]
    fn test_accumulator_reorders_out_of_order_appends() {
        let accumulator = HocrAccumulator::new();
        accumulator.append(2, "<page-2/>".to_owned());
        accumulator.append(1, "<page-1/>".to_owned());
        let doc = accumulator.finalize();
        let pos1 = doc.find("<page-1/>").unwrap();
        let pos2 = doc.find("<page-2/>").unwrap();
        assert!(pos1 < pos2);
    }
}
