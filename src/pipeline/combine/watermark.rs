//! Section watermarks.
//!
//! The first page of every student section carries a small text line:
//! `GRADELOOP|<key>|<method>|<n1>+<n2>...` (segment page counts) or
//! `GRADELOOP|<key>|-|NOSUB` for placeholders. It is written into its own
//! content stream so it can be found again by scanning content, and it is
//! legible enough to be read back by OCR when the content was flattened.

use std::sync::LazyLock;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use regex::Regex;

use super::CombineError;
use crate::pipeline::naming::MatchMethod;

pub const PREFIX: &str = "GRADELOOP";
const NO_SUBMISSION: &str = "NOSUB";
/// Resource name of the watermark font.
const FONT_NAME: &[u8] = b"GLWM";
const FONT_SIZE: i64 = 6;
const MARGIN: i64 = 8;

// OCR may read the separator bar as I, l or 1. Keys are any run without
// whitespace or a bar, so `+` and non-ASCII usernames come back intact.
static WATERMARK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"GRADELOOP\s*[|Il1]\s*([^|\s]+?)\s*[|Il1]\s*([EPFU-])\s*[|Il1]\s*(NOSUB|\d+(?:\s*\+\s*\d+)*)",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub student_key: String,
    /// `None` for placeholders.
    pub match_method: Option<MatchMethod>,
    /// Page count of each source PDF in the section.
    pub segment_pages: Vec<usize>,
}

impl Watermark {
    pub fn for_student(student_key: &str, method: MatchMethod, segment_pages: Vec<usize>) -> Self {
        Self {
            student_key: student_key.to_string(),
            match_method: Some(method),
            segment_pages,
        }
    }

    pub fn placeholder(student_key: &str) -> Self {
        Self {
            student_key: student_key.to_string(),
            match_method: None,
            segment_pages: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.match_method.is_none()
    }

    /// Pages in the section this watermark opens.
    pub fn page_count(&self) -> usize {
        if self.is_placeholder() {
            1
        } else {
            self.segment_pages.iter().sum()
        }
    }

    pub fn render(&self) -> String {
        match self.match_method {
            None => format!("{PREFIX}|{}|-|{NO_SUBMISSION}", self.student_key),
            Some(method) => {
                let pages = self
                    .segment_pages
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join("+");
                format!("{PREFIX}|{}|{}|{pages}", self.student_key, method.code())
            }
        }
    }

    /// Whether `parse` gives this watermark back from its rendered text.
    pub fn round_trips(&self) -> bool {
        Self::parse(&self.render()).as_ref() == Some(self)
    }

    /// Find a watermark anywhere in `text`.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = WATERMARK.captures(text)?;
        let student_key = caps.get(1)?.as_str().to_string();
        let method = caps.get(2)?.as_str();
        let pages = caps.get(3)?.as_str();

        if method == "-" {
            return (pages == NO_SUBMISSION).then(|| Self::placeholder(&student_key));
        }
        let match_method = MatchMethod::from_code(method.chars().next()?)?;
        let segment_pages = pages
            .split('+')
            .map(|n| n.trim().parse::<usize>().ok())
            .collect::<Option<Vec<_>>>()?;
        if segment_pages.iter().any(|n| *n == 0) {
            return None;
        }
        Some(Self {
            student_key,
            match_method: Some(match_method),
            segment_pages,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Stamping
// ═══════════════════════════════════════════════════════════

fn number(obj: &Object) -> Option<i64> {
    match obj {
        Object::Integer(i) => Some(*i),
        Object::Real(r) => Some(r.round() as i64),
        _ => None,
    }
}

/// Lower-left corner of the page's MediaBox.
fn media_origin(page: &Dictionary) -> (i64, i64) {
    page.get(b"MediaBox")
        .and_then(Object::as_array)
        .ok()
        .and_then(|b| Some((number(b.first()?)?, number(b.get(1)?)?)))
        .unwrap_or((0, 0))
}

fn resolved_dict(doc: &Document, obj: Option<&Object>) -> Dictionary {
    match obj {
        Some(Object::Reference(id)) => doc.get_dictionary(*id).cloned().unwrap_or_default(),
        Some(Object::Dictionary(d)) => d.clone(),
        _ => Dictionary::new(),
    }
}

/// Stamp `watermark` onto `page_id`. Existing content is wrapped in `q`/`Q`
/// so its graphics state cannot leak into the watermark.
pub fn stamp_page(
    doc: &mut Document,
    page_id: ObjectId,
    watermark: &Watermark,
) -> Result<(), CombineError> {
    if !watermark.round_trips() {
        return Err(CombineError::UnstampableKey(watermark.student_key.clone()));
    }
    let page = doc.get_dictionary(page_id)?;
    let (x, y) = media_origin(page);
    let mut resources = resolved_dict(doc, page.get(b"Resources").ok());
    let mut fonts = resolved_dict(doc, resources.get(b"Font").ok());
    let old_contents: Vec<Object> = match page.get(b"Contents") {
        Ok(Object::Array(items)) => items.clone(),
        Ok(obj @ Object::Reference(_)) => vec![obj.clone()],
        _ => Vec::new(),
    };

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    fonts.set(FONT_NAME.to_vec(), font_id);
    resources.set("Font", fonts);

    let mark = Content {
        operations: vec![
            Operation::new("Q", vec![]),
            Operation::new("q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![Object::Name(FONT_NAME.to_vec()), FONT_SIZE.into()]),
            Operation::new("Td", vec![(x + MARGIN).into(), (y + MARGIN).into()]),
            Operation::new(
                "Tj",
                vec![Object::String(
                    watermark.render().into_bytes(),
                    StringFormat::Literal,
                )],
            ),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
        ],
    };
    let open_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    // Page content streams are concatenated when read, so start on a fresh line.
    let mut mark_bytes = b"\n".to_vec();
    mark_bytes.extend(mark.encode()?);
    let mark_id = doc.add_object(Stream::new(dictionary! {}, mark_bytes));

    let mut contents = Vec::with_capacity(old_contents.len() + 2);
    contents.push(Object::Reference(open_id));
    contents.extend(old_contents);
    contents.push(Object::Reference(mark_id));

    let page = doc.get_dictionary_mut(page_id)?;
    page.set("Resources", resources);
    page.set("Contents", contents);
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Reading back
// ═══════════════════════════════════════════════════════════

fn stream_bytes(doc: &Document, id: ObjectId) -> Option<Vec<u8>> {
    let stream = doc.get_object(id).and_then(Object::as_stream).ok()?;
    Some(
        stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone()),
    )
}

fn watermark_in_stream(bytes: &[u8]) -> Option<Watermark> {
    let content = Content::decode(bytes).ok()?;
    content.operations.iter().find_map(|op| {
        if op.operator != "Tj" {
            return None;
        }
        match op.operands.first() {
            Some(Object::String(s, _)) => Watermark::parse(&String::from_utf8_lossy(s)),
            _ => None,
        }
    })
}

/// Scan a page's content streams for a watermark. Streams that fail to
/// decode are skipped.
pub fn read_watermark(doc: &Document, page_id: ObjectId) -> Option<Watermark> {
    doc.get_page_contents(page_id)
        .into_iter()
        .rev()
        .filter_map(|id| stream_bytes(doc, id))
        .find_map(|bytes| watermark_in_stream(&bytes))
}

fn is_mark(op: &Operation) -> bool {
    op.operator == "Tj"
        && matches!(op.operands.first(),
            Some(Object::String(s, _)) if Watermark::parse(&String::from_utf8_lossy(s)).is_some())
}

fn shows_text(op: &Operation) -> bool {
    matches!(op.operator.as_str(), "Tj" | "TJ" | "'" | "\"")
}

/// Drop the watermark run from `ops`: the whole `q BT .. ET Q` group written
/// by `stamp_page` when the text object holds nothing else, otherwise only
/// the text-showing operator.
fn remove_mark(ops: &mut Vec<Operation>) -> bool {
    let Some(tj) = ops.iter().position(is_mark) else {
        return false;
    };
    let bt = ops[..tj].iter().rposition(|op| op.operator == "BT");
    let et = ops[tj..].iter().position(|op| op.operator == "ET").map(|i| tj + i);
    let (Some(bt), Some(et)) = (bt, et) else {
        ops.remove(tj);
        return true;
    };
    let shared = ops[bt..=et]
        .iter()
        .enumerate()
        .any(|(i, op)| bt + i != tj && shows_text(op));
    if shared {
        ops.remove(tj);
        return true;
    }
    let wrapped = bt > 0
        && ops[bt - 1].operator == "q"
        && ops.get(et + 1).is_some_and(|op| op.operator == "Q");
    if wrapped {
        ops.drain(bt - 1..=et + 1);
    } else {
        ops.drain(bt..=et);
    }
    true
}

/// Remove the watermark written by `stamp_page`, leaving every other
/// operator on the page in place. Editors often merge a page's content
/// into one stream, so the text run is cut out of whichever stream holds
/// it. Streams left empty (and the bare `q` / `Q` pair around the original
/// content) are dropped. Returns whether a watermark was found.
pub fn strip_watermark(doc: &mut Document, page_id: ObjectId) -> Result<bool, CombineError> {
    let ids = doc.get_page_contents(page_id);
    for (pos, &id) in ids.iter().enumerate().rev() {
        let Some(bytes) = stream_bytes(doc, id) else {
            continue;
        };
        let Ok(mut content) = Content::decode(&bytes) else {
            continue;
        };
        if !remove_mark(&mut content.operations) {
            continue;
        }

        let only_close = content.operations.len() == 1 && content.operations[0].operator == "Q";
        let opens_with_q = pos > 0
            && ids
                .first()
                .and_then(|first| stream_bytes(doc, *first))
                .is_some_and(|b| b.trim_ascii() == b"q");

        let mut kept = ids.clone();
        if content.operations.is_empty() {
            kept.remove(pos);
        } else if only_close && opens_with_q {
            kept.remove(pos);
            kept.remove(0);
        } else {
            let encoded = content.encode()?;
            doc.get_object_mut(id)
                .and_then(Object::as_stream_mut)?
                .set_plain_content(encoded);
        }

        let contents: Vec<Object> = kept.into_iter().map(Object::Reference).collect();
        doc.get_dictionary_mut(page_id)?.set("Contents", contents);
        return Ok(true);
    }
    Ok(false)
}
