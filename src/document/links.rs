use crate::document::types::{DocumentLinks, RelationshipLinks, ResourceLinks};
use crate::query::{QueryParams, Window};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters escaped inside one path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Builds every URL of a document from the configured base.
#[derive(Clone, Copy, Debug)]
pub struct LinkBuilder<'a> {
    base: &'a str,
}

impl<'a> LinkBuilder<'a> {
    pub fn new(base: &'a str) -> Self {
        LinkBuilder { base }
    }

    pub fn collection(&self, type_name: &str) -> String {
        format!("{}/{}", self.base, utf8_percent_encode(type_name, SEGMENT))
    }

    pub fn resource(&self, type_name: &str, id: &str) -> ResourceLinks {
        ResourceLinks {
            self_link: format!("{}/{}", self.collection(type_name), utf8_percent_encode(id, SEGMENT)),
        }
    }

    /// `{base}/{type}/{id}/relationships/{alias}` and `{base}/{type}/{id}/{alias}`.
    pub fn relationship(&self, type_name: &str, id: &str, alias: &str) -> RelationshipLinks {
        let resource = self.resource(type_name, id).self_link;
        let alias = utf8_percent_encode(alias, SEGMENT);
        RelationshipLinks {
            self_link: format!("{}/relationships/{}", resource, alias),
            related: format!("{}/{}", resource, alias),
        }
    }

    /// Top-level links of a collection: `self` reflects the current window, `first`/`prev`/
    /// `next` are added for offset windows and `next` for cursor windows.
    pub fn paginated(
        &self,
        path: &str,
        params: &QueryParams,
        window: &Window,
        has_more: bool,
        next_cursor: Option<&str>,
    ) -> DocumentLinks {
        let url = |page: &[(&str, String)]| {
            let query = params.to_query_string(page);
            if query.is_empty() {
                path.to_string()
            } else {
                format!("{}?{}", path, query)
            }
        };
        match window {
            Window::Offset { offset, limit } => {
                let at = |offset: u64| url(&[("offset", offset.to_string()), ("limit", limit.to_string())]);
                DocumentLinks {
                    self_link: at(*offset),
                    first: Some(at(0)),
                    prev: (*offset > 0).then(|| at(offset.saturating_sub(*limit))),
                    next: has_more.then(|| at(offset + limit)),
                }
            }
            Window::Cursor { limit, .. } => {
                let current = params.page.cursor.clone().unwrap_or_default();
                DocumentLinks {
                    self_link: url(&[("cursor", current), ("size", limit.to_string())]),
                    first: Some(url(&[("cursor", String::new()), ("size", limit.to_string())])),
                    prev: None,
                    next: next_cursor.map(|c| url(&[("cursor", c.to_string()), ("size", limit.to_string())])),
                }
            }
        }
    }
}
