//! Page-order-preserving merge of whole PDF documents with lopdf.

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};

use super::CombineError;

/// Page attributes a page may inherit from its `Pages` ancestors.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];
const MAX_TREE_DEPTH: usize = 64;

fn dict_type(dict: &Dictionary) -> Option<&[u8]> {
    match dict.get(b"Type").ok()? {
        Object::Name(name) => Some(name.as_slice()),
        _ => None,
    }
}

fn inherited_value(doc: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let dict = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value.clone());
        }
        parent = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

/// Copy inherited attributes onto each page so pages survive being moved
/// under a different `Pages` node.
pub fn flatten_inherited(doc: &mut Document) {
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page_id in page_ids {
        let inherited: Vec<(&[u8], Object)> = match doc.get_dictionary(page_id) {
            Ok(page) => INHERITABLE
                .iter()
                .filter(|key| !page.has(key))
                .filter_map(|key| inherited_value(doc, page, key).map(|v| (*key, v)))
                .collect(),
            Err(_) => continue,
        };
        if let Ok(page) = doc.get_dictionary_mut(page_id) {
            for (key, value) in inherited {
                page.set(key.to_vec(), value);
            }
        }
    }
}

/// Appends documents one after another under a single page tree.
pub struct Merger {
    out: Document,
    pages_id: ObjectId,
    kids: Vec<ObjectId>,
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl Merger {
    pub fn new() -> Self {
        let mut out = Document::with_version("1.5");
        let pages_id = out.new_object_id();
        Self {
            out,
            pages_id,
            kids: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Append every page of `src`. Returns the new page ids in order.
    pub fn append(&mut self, mut src: Document) -> Result<Vec<ObjectId>, CombineError> {
        flatten_inherited(&mut src);
        src.renumber_objects_with(self.out.max_id + 1);
        let page_ids: Vec<ObjectId> = src.get_pages().into_values().collect();
        if page_ids.is_empty() {
            return Err(CombineError::EmptyDocument);
        }

        for (id, mut object) in std::mem::take(&mut src.objects) {
            if let Object::Dictionary(ref mut dict) = object {
                let kind = dict_type(dict).map(<[u8]>::to_vec);
                match kind.as_deref() {
                    Some(b"Catalog") | Some(b"Pages") => continue,
                    Some(b"Page") => dict.set("Parent", self.pages_id),
                    _ => {}
                }
            }
            self.out.objects.insert(id, object);
        }
        self.out.max_id = self.out.max_id.max(src.max_id);
        self.kids.extend(page_ids.iter().copied());
        Ok(page_ids)
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.out
    }

    /// Close the page tree and drop objects no page refers to.
    pub fn finish(mut self) -> Document {
        let count = self.kids.len() as i64;
        let kids: Vec<Object> = self.kids.iter().map(|id| Object::Reference(*id)).collect();
        self.out.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.out.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.out.trailer.set("Root", catalog_id);
        self.out.prune_objects();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::combine::tests::{fixture_pdf, page_texts};

    #[test]
    fn merge_preserves_document_and_page_order() {
        let mut merger = Merger::new();
        let a = Document::load_mem(&fixture_pdf(&["a1", "a2"])).unwrap();
        let b = Document::load_mem(&fixture_pdf(&["b1"])).unwrap();
        let c = Document::load_mem(&fixture_pdf(&["c1", "c2", "c3"])).unwrap();
        assert_eq!(merger.append(a).unwrap().len(), 2);
        assert_eq!(merger.append(b).unwrap().len(), 1);
        assert_eq!(merger.append(c).unwrap().len(), 3);
        assert_eq!(merger.page_count(), 6);

        let mut doc = merger.finish();
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        assert_eq!(
            page_texts(&buf),
            vec!["a1", "a2", "b1", "c1", "c2", "c3"]
        );
    }

    #[test]
    fn inherited_resources_are_copied_to_pages() {
        // fixture pages inherit MediaBox and Resources from their Pages node
        let mut doc = Document::load_mem(&fixture_pdf(&["x"])).unwrap();
        let page_id = doc.get_pages()[&1];
        assert!(!doc.get_dictionary(page_id).unwrap().has(b"Resources"));
        flatten_inherited(&mut doc);
        let page = doc.get_dictionary(page_id).unwrap();
        assert!(page.has(b"Resources"));
        assert!(page.has(b"MediaBox"));
    }
}
