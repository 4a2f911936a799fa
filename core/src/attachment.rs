//! Attachment validation.
//!
//! Attachments ride along with a request to give reviewers context. Inline
//! text is stored as-is; binary payloads (screenshots in particular) travel
//! as `data:<mime>;base64,…` URIs. Limits are enforced here, before the
//! request is persisted, so oversized evidence never reaches the store.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use serde::Serialize;
use slb_protocol::Attachment;
use slb_protocol::Result;
use slb_protocol::SlbErr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentLimits {
    pub max_file_bytes: u64,
    pub max_image_dimension: u32,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
            max_image_dimension: 4096,
        }
    }
}

pub fn validate_attachment(attachment: &Attachment, limits: &AttachmentLimits) -> Result<()> {
    match attachment.content.strip_prefix("data:") {
        Some(rest) => {
            let (mime, payload) = rest.split_once(";base64,").ok_or_else(|| {
                SlbErr::validation("attachment", "data URI must be base64-encoded")
            })?;
            let bytes = BASE64_STANDARD.decode(payload.trim()).map_err(|e| {
                SlbErr::validation("attachment", format!("invalid base64 payload: {e}"))
            })?;
            check_size(bytes.len() as u64, limits)?;
            if mime.starts_with("image/") {
                check_image_dimensions(&bytes, limits)?;
            }
            Ok(())
        }
        None => check_size(attachment.content.len() as u64, limits),
    }
}

fn check_size(observed: u64, limits: &AttachmentLimits) -> Result<()> {
    if observed > limits.max_file_bytes {
        return Err(SlbErr::validation(
            "attachment",
            format!(
                "attachment of {observed} bytes exceeds the {} byte limit",
                limits.max_file_bytes
            ),
        ));
    }
    Ok(())
}

fn check_image_dimensions(bytes: &[u8], limits: &AttachmentLimits) -> Result<()> {
    let size = imagesize::blob_size(bytes)
        .map_err(|e| SlbErr::validation("attachment", format!("unreadable image: {e}")))?;
    let max = limits.max_image_dimension as usize;
    if size.width > max || size.height > max {
        return Err(SlbErr::validation(
            "attachment",
            format!(
                "image {}x{} exceeds the maximum of {max}x{max}",
                size.width, size.height
            ),
        ));
    }
    Ok(())
}
