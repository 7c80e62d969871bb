//! Pending uploads and the file descriptor exchanged with the client.

use serde::{Deserialize, Serialize};

/// A row of `tbl_uploads`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct UploadRow {
    pub id: i64,
    pub user_id: i64,
    pub datetime: String,
    pub uniqid: String,
    pub app: String,
    pub name: String,
    pub size: i64,
    pub r#type: String,
    pub file: String,
    pub hash: String,
}

/// File descriptor sent by `upload/addfile` and `upload/delfile`.
///
/// On the way in `data` carries a `data:<type>;base64,...` URL; on the way
/// out it is emptied and `file`/`hash` describe the stored copy.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileEntry {
    pub id: String,
    pub app: String,
    pub name: String,
    pub size: i64,
    pub r#type: String,
    pub data: String,
    pub error: String,
    pub file: String,
    pub hash: String,
}
