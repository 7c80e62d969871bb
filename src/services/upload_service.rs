//! Pending uploads: files sent as data URLs by the client are kept in the
//! upload directory and registered in `tbl_uploads` until an app claims them
//! or the garbage collector removes them.

use crate::{
    datetime::current_datetime,
    db::{Database, record},
    models::upload::{FileEntry, UploadRow},
    sql::{prepare_insert_query, prepare_where_query},
    text::encode_bad_chars_file,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use md5::Context;
use serde_json::{Value, json};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ServiceResult;

#[derive(Clone)]
pub struct UploadService {
    db: Database,
    dir: PathBuf,
}

impl UploadService {
    pub fn new(db: Database, dir: impl Into<PathBuf>) -> Self {
        Self { db, dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store the payload of `entry` and register it for `user_id`.
    ///
    /// A payload that is not a `data:<type>;base64,` URL of exactly `size`
    /// bytes leaves the entry unchanged apart from the emptied `data`.
    pub async fn add_file(&self, mut entry: FileEntry, user_id: i64) -> ServiceResult<FileEntry> {
        let data = std::mem::take(&mut entry.data);
        let prefix = format!("data:{};base64,", entry.r#type);
        let Some(payload) = data.strip_prefix(&prefix) else {
            return Ok(entry);
        };
        let Ok(bytes) = BASE64.decode(payload) else {
            return Ok(entry);
        };
        if i64::try_from(bytes.len()).ok() != Some(entry.size) {
            return Ok(entry);
        }

        let file = format!(
            "{}_{}_{}",
            Utc::now().timestamp(),
            Uuid::new_v4().simple(),
            encode_bad_chars_file(&entry.name)
        );
        let hash = self.write_atomic(&file, &bytes).await?;
        entry.file = file;
        entry.hash = hash;

        let row = json!({
            "user_id": user_id,
            "datetime": current_datetime(0),
            "uniqid": entry.id,
            "app": entry.app,
            "name": entry.name,
            "size": entry.size,
            "type": entry.r#type,
            "file": entry.file,
            "hash": entry.hash,
        });
        let (query, params) = prepare_insert_query(&self.db, "tbl_uploads", &record(row)).await?;
        self.db.query(&query, &params).await?;
        debug!("stored upload {} ({} bytes)", entry.file, entry.size);
        Ok(entry)
    }

    /// Write through a temp file and rename into place; returns the md5.
    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> ServiceResult<String> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let tmp_path = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut digest = Context::new();
        digest.consume(bytes);
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(format!("{:x}", digest.compute()))
    }

    /// Remove a stored upload of `user_id`.
    ///
    /// The entry must match its `tbl_uploads` row, name a sanitized file and
    /// agree with the size and md5 on disk; otherwise it is returned as is.
    pub async fn del_file(&self, mut entry: FileEntry, user_id: i64) -> ServiceResult<FileEntry> {
        let filter = record(json!({
            "user_id": user_id,
            "uniqid": entry.id,
            "app": entry.app,
            "name": entry.name,
            "size": entry.size,
            "type": entry.r#type,
            "file": entry.file,
            "hash": entry.hash,
        }));
        let (clause, params) = prepare_where_query(&self.db, "tbl_uploads", &filter).await?;
        let id = self
            .db
            .execute_scalar(&format!("SELECT id FROM tbl_uploads WHERE {}", clause), &params)
            .await?;
        if id == 0 || encode_bad_chars_file(&entry.file) != entry.file {
            return Ok(entry);
        }

        let path = self.dir.join(&entry.file);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entry),
            Err(err) => return Err(err.into()),
        };
        if i64::try_from(bytes.len()).ok() != Some(entry.size)
            || format!("{:x}", md5::compute(&bytes)) != entry.hash
        {
            return Ok(entry);
        }

        fs::remove_file(&path).await?;
        self.db
            .query("DELETE FROM tbl_uploads WHERE id = ?", &[json!(id)])
            .await?;
        entry.file.clear();
        entry.hash.clear();
        Ok(entry)
    }

    /// Drop uploads older than `timeout` seconds.
    pub async fn gc_upload(&self, timeout: i64) -> ServiceResult<Value> {
        let rows = self
            .db
            .fetch_all_as::<UploadRow>(
                "SELECT * FROM tbl_uploads WHERE datetime < ?",
                &[json!(current_datetime(-timeout))],
            )
            .await?;
        let mut deleted = Vec::with_capacity(rows.len());
        for row in rows {
            let path = self.dir.join(&row.file);
            if let Err(err) = fs::remove_file(&path).await {
                if err.kind() != ErrorKind::NotFound {
                    warn!("could not remove {}: {}", path.display(), err);
                }
            }
            self.db
                .query("DELETE FROM tbl_uploads WHERE id = ?", &[json!(row.id)])
                .await?;
            deleted.push(path.display().to_string());
        }
        Ok(json!({ "count": deleted.len(), "deleted": deleted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestApp;

    fn entry(bytes: &[u8]) -> FileEntry {
        FileEntry {
            id: "upload-1".into(),
            app: "customers".into(),
            name: "Report Q1.PDF".into(),
            size: bytes.len() as i64,
            r#type: "application/pdf".into(),
            data: format!("data:application/pdf;base64,{}", BASE64.encode(bytes)),
            ..FileEntry::default()
        }
    }

    fn service(app: &TestApp) -> UploadService {
        UploadService::new(app.state.db.clone(), app.state.config.upload_dir())
    }

    #[tokio::test]
    async fn add_then_delete_round_trip() {
        let app = TestApp::new().await;
        let uploads = service(&app);

        let stored = uploads.add_file(entry(b"%PDF-1.4 demo"), 2).await.unwrap();
        assert!(stored.data.is_empty());
        assert!(stored.file.ends_with("_report_q1.pdf"));
        assert_eq!(stored.hash, format!("{:x}", md5::compute(b"%PDF-1.4 demo")));
        let on_disk = std::fs::read(uploads.dir().join(&stored.file)).unwrap();
        assert_eq!(on_disk, b"%PDF-1.4 demo");

        // Another user cannot remove it.
        let kept = uploads.del_file(stored.clone(), 3).await.unwrap();
        assert_eq!(kept.file, stored.file);

        let removed = uploads.del_file(stored.clone(), 2).await.unwrap();
        assert!(removed.file.is_empty() && removed.hash.is_empty());
        assert!(!uploads.dir().join(&stored.file).exists());
        let rows = app.state.db.execute_scalar("SELECT COUNT(*) FROM tbl_uploads", &[]).await.unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn malformed_payloads_are_not_stored() {
        let app = TestApp::new().await;
        let uploads = service(&app);

        let mut wrong_size = entry(b"abc");
        wrong_size.size = 4;
        let out = uploads.add_file(wrong_size, 2).await.unwrap();
        assert!(out.file.is_empty() && out.data.is_empty());

        let mut wrong_type = entry(b"abc");
        wrong_type.r#type = "image/png".into();
        assert!(uploads.add_file(wrong_type, 2).await.unwrap().file.is_empty());
    }

    #[tokio::test]
    async fn gc_removes_expired_uploads() {
        let app = TestApp::new().await;
        let uploads = service(&app);
        let stored = uploads.add_file(entry(b"old"), 2).await.unwrap();
        app.state
            .db
            .query("UPDATE tbl_uploads SET datetime = '2000-01-01 00:00:00'", &[])
            .await
            .unwrap();
        uploads.add_file(entry(b"fresh"), 2).await.unwrap();

        let report = uploads.gc_upload(3600).await.unwrap();
        assert_eq!(report["count"], 1);
        assert!(report["deleted"][0].as_str().unwrap().ends_with(&stored.file));
        assert!(!uploads.dir().join(&stored.file).exists());
    }
}
