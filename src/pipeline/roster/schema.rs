//! Resolved column layout of a D2L grade import file.
//!
//! Layout: five identity columns, zero or more grade columns, the End-of-Line
//! Indicator, then optionally a Verify column. The indicator index is always
//! found by header name because the number of grade columns varies per run.

use serde::Serialize;

use super::RosterError;

pub const ORG_DEFINED_ID: &str = "OrgDefinedId";
pub const USERNAME: &str = "Username";
pub const FIRST_NAME: &str = "First Name";
pub const LAST_NAME: &str = "Last Name";
pub const EMAIL: &str = "Email";
pub const END_OF_LINE: &str = "End-of-Line Indicator";
pub const VERIFY: &str = "Verify";

/// Value D2L expects in every indicator cell.
pub const END_OF_LINE_VALUE: &str = "#";

/// Identity columns in canonical order.
pub const IDENTITY_COLUMNS: [&str; 5] = [ORG_DEFINED_ID, USERNAME, FIRST_NAME, LAST_NAME, EMAIL];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFileSchema {
    pub headers: Vec<String>,
    /// Index of each identity column, in `IDENTITY_COLUMNS` order.
    pub identity: [usize; 5],
    /// Columns between the last identity column and the indicator.
    pub grade_columns: Vec<usize>,
    pub indicator: usize,
    /// Verify column directly after the indicator, when present.
    pub verify: Option<usize>,
    /// Anything else after the indicator (left over from an aborted run).
    pub trailing: Vec<usize>,
}

pub(crate) fn header_matches(header: &str, name: &str) -> bool {
    header
        .trim_start_matches('\u{feff}')
        .trim()
        .eq_ignore_ascii_case(name)
}

impl ImportFileSchema {
    /// Resolve the schema from a header row. Reports every missing required
    /// column at once.
    pub fn resolve(headers: &[String]) -> Result<Self, RosterError> {
        let find = |name: &str| headers.iter().position(|h| header_matches(h, name));

        let mut missing = Vec::new();
        let mut identity = [0usize; 5];
        for (slot, name) in IDENTITY_COLUMNS.iter().enumerate() {
            match find(name) {
                Some(idx) => identity[slot] = idx,
                None => missing.push(name.to_string()),
            }
        }
        let indicator = find(END_OF_LINE);
        if indicator.is_none() {
            missing.push(END_OF_LINE.to_string());
        }
        let indicator = match indicator {
            Some(idx) if missing.is_empty() => idx,
            _ => return Err(RosterError::MissingColumns(missing)),
        };

        let last_identity = identity.iter().copied().max().unwrap_or(0);
        if indicator < last_identity {
            return Err(RosterError::MalformedSchema(format!(
                "'{END_OF_LINE}' appears before the identity columns"
            )));
        }

        let grade_columns: Vec<usize> = (last_identity + 1..indicator)
            .filter(|idx| !identity.contains(idx))
            .collect();

        let after: Vec<usize> = (indicator + 1..headers.len()).collect();
        let verify = after
            .first()
            .copied()
            .filter(|&idx| header_matches(&headers[idx], VERIFY));
        let trailing = after
            .into_iter()
            .filter(|idx| Some(*idx) != verify)
            .collect();

        Ok(Self {
            headers: headers.to_vec(),
            identity,
            grade_columns,
            indicator,
            verify,
            trailing,
        })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| header_matches(h, name))
    }

    pub fn username(&self) -> usize {
        self.identity[1]
    }

    pub fn first_name(&self) -> usize {
        self.identity[2]
    }

    pub fn last_name(&self) -> usize {
        self.identity[3]
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_plain_layout() {
        let schema = ImportFileSchema::resolve(&headers(&[
            "OrgDefinedId",
            "Username",
            "First Name",
            "Last Name",
            "Email",
            "End-of-Line Indicator",
        ]))
        .unwrap();
        assert_eq!(schema.identity, [0, 1, 2, 3, 4]);
        assert!(schema.grade_columns.is_empty());
        assert_eq!(schema.indicator, 5);
        assert_eq!(schema.verify, None);
    }

    #[test]
    fn indicator_found_after_variable_grade_columns() {
        let schema = ImportFileSchema::resolve(&headers(&[
            "OrgDefinedId",
            "Username",
            "First Name",
            "Last Name",
            "Email",
            "Quiz 1 Points Grade",
            "Quiz 2 Points Grade",
            "End-of-Line Indicator",
            "Verify",
            "Stale",
        ]))
        .unwrap();
        assert_eq!(schema.grade_columns, vec![5, 6]);
        assert_eq!(schema.indicator, 7);
        assert_eq!(schema.verify, Some(8));
        assert_eq!(schema.trailing, vec![9]);
    }

    #[test]
    fn missing_email_listed_alone() {
        let err = ImportFileSchema::resolve(&headers(&[
            "OrgDefinedId",
            "Username",
            "First Name",
            "Last Name",
            "End-of-Line Indicator",
        ]))
        .unwrap_err();
        match err {
            RosterError::MissingColumns(cols) => assert_eq!(cols, vec!["Email".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn every_missing_column_listed() {
        let err = ImportFileSchema::resolve(&headers(&["Username", "Email"])).unwrap_err();
        match err {
            RosterError::MissingColumns(cols) => assert_eq!(
                cols,
                vec!["OrgDefinedId", "First Name", "Last Name", "End-of-Line Indicator"]
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn header_match_ignores_case_whitespace_and_bom() {
        assert!(header_matches("\u{feff}orgdefinedid ", ORG_DEFINED_ID));
        assert!(header_matches(" end-of-line indicator", END_OF_LINE));
        assert!(!header_matches("Emails", EMAIL));
    }
}
