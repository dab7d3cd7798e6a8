//! D2L submission folder names.
//!
//! `123456-789012 - Jane Q Doe - Jan 5, 2024 1023 AM`

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

static D2L_FOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+-\d+)\s+-\s+(.+?)\s+-\s+([A-Za-z]{3}\s+\d{1,2},\s+\d{4})\s+(\d{3,4})\s+([AaPp][Mm])$",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderName {
    /// `<submission id>-<user id>` prefix.
    pub submission_id: String,
    pub display_name: String,
    pub submitted_at: NaiveDateTime,
}

/// Parse a D2L submission folder name. Returns `None` for anything else.
pub fn parse_folder_name(name: &str) -> Option<FolderName> {
    let caps = D2L_FOLDER.captures(name.trim())?;
    let date = caps.get(3)?.as_str();
    let time = format!("{:0>4}", caps.get(4)?.as_str());
    let meridiem = caps.get(5)?.as_str().to_uppercase();
    let date = date.split_whitespace().collect::<Vec<_>>().join(" ");

    let submitted_at =
        NaiveDateTime::parse_from_str(&format!("{date} {time} {meridiem}"), "%b %d, %Y %I%M %p")
            .ok()?;

    Some(FolderName {
        submission_id: caps.get(1)?.as_str().to_string(),
        display_name: caps.get(2)?.as_str().trim().to_string(),
        submitted_at,
    })
}
