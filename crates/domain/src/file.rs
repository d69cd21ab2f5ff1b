use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{FileId, Timestamp, UserId};

const MAX_FILE_NAME_LEN: usize = 255;

/// 可以按原类型内联返回的图片类型。SVG 可内嵌脚本，不在其中。
const INLINE_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// 上传的文件，用作消息附件或房间图标。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: FileId,
    pub uploaded_by: UserId,
    pub file_name: String,
    pub content_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: Timestamp,
}

impl UploadedFile {
    /// 校验并构造上传文件。
    ///
    /// 文件名只保留最后一个路径分量；空文件与超过 `max_bytes` 的文件被拒绝。
    pub fn new(
        id: FileId,
        uploaded_by: UserId,
        file_name: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
        max_bytes: usize,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        let file_name = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_owned();
        if file_name.is_empty() {
            return Err(DomainError::validation("file.name", "cannot be empty"));
        }
        if file_name.chars().count() > MAX_FILE_NAME_LEN {
            return Err(DomainError::validation("file.name", "too long"));
        }
        if data.is_empty() {
            return Err(DomainError::validation("file.data", "file is empty"));
        }
        if data.len() > max_bytes {
            return Err(DomainError::validation(
                "file.data",
                format!("file exceeds {max_bytes} bytes"),
            ));
        }
        let content_type = content_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("application/octet-stream")
            .to_owned();

        Ok(Self {
            id,
            uploaded_by,
            file_name,
            content_type,
            data,
            uploaded_at: now,
        })
    }

    /// 下载时能否按声明的类型内联展示，其余一律作为附件下载。
    pub fn is_inline_safe(&self) -> bool {
        let essence = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        INLINE_CONTENT_TYPES
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 对外暴露的下载地址。
    pub fn url_for(id: FileId) -> String {
        format!("/api/v1/files/{id}")
    }

    pub fn url(&self) -> String {
        Self::url_for(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn build(name: &str, data: Vec<u8>, max: usize) -> Result<UploadedFile, DomainError> {
        UploadedFile::new(
            FileId::generate(),
            UserId::generate(),
            name,
            None,
            data,
            max,
            OffsetDateTime::now_utc(),
        )
    }

    #[test]
    fn path_components_are_stripped_from_name() {
        let file = build("../../etc/passwd", vec![1], 16).unwrap();
        assert_eq!(file.file_name, "passwd");
        assert_eq!(file.content_type, "application/octet-stream");
    }

    #[test]
    fn only_raster_images_are_inline_safe() {
        let with_type = |content_type: &str| {
            UploadedFile::new(
                FileId::generate(),
                UserId::generate(),
                "f",
                Some(content_type),
                vec![1],
                16,
                OffsetDateTime::now_utc(),
            )
            .unwrap()
        };
        assert!(with_type("image/png").is_inline_safe());
        assert!(with_type("IMAGE/JPEG; charset=binary").is_inline_safe());
        assert!(!with_type("text/html").is_inline_safe());
        assert!(!with_type("image/svg+xml").is_inline_safe());
        assert!(!build("a.png", vec![1], 16).unwrap().is_inline_safe());
    }

    #[test]
    fn empty_and_oversized_files_are_rejected() {
        assert!(build("a.png", Vec::new(), 16).is_err());
        assert!(build("a.png", vec![0; 17], 16).is_err());
        assert!(build("a.png", vec![0; 16], 16).is_ok());
    }
}
