//! Daily digest rendering and delivery.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tokio::fs;
use tracing::debug;
use zfcg_core::Announcement;

/// Rendered notification for one day's new announcements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub subject: String,
    pub html: String,
    pub count: usize,
}

/// `None` when there is nothing to announce.
pub fn render_digest(announcements: &[Announcement]) -> Option<Digest> {
    if announcements.is_empty() {
        return None;
    }
    let mut html = String::from("<h2>今日新增公告</h2><ul>");
    for ann in announcements {
        html.push_str(&format!(
            "<li><a href='{}'>{}</a> - {}</li>",
            html_escape::encode_single_quoted_attribute(&ann.url),
            html_escape::encode_text(&ann.title),
            html_escape::encode_text(&ann.publish_date),
        ));
    }
    html.push_str("</ul>");
    Some(Digest {
        subject: format!("政府采购网公告通知 - {}条新公告", announcements.len()),
        html,
        count: announcements.len(),
    })
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, digest: &Digest) -> Result<()>;
}

/// Writes each digest as an HTML file under `<reports>/digests/<date>/`.
#[derive(Debug, Clone)]
pub struct DigestFileNotifier {
    dir: PathBuf,
}

impl DigestFileNotifier {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: reports_dir.into().join("digests"),
        }
    }

    pub fn path_for(&self, recipient: &str) -> PathBuf {
        let stem: String = recipient
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir
            .join(Local::now().format("%Y-%m-%d").to_string())
            .join(format!("{stem}.html"))
    }
}

#[async_trait]
impl Notifier for DigestFileNotifier {
    async fn notify(&self, recipient: &str, digest: &Digest) -> Result<()> {
        let path = self.path_for(recipient);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let page = format!(
            "<!DOCTYPE html>\n<html><head><meta charset='utf-8'><title>{}</title></head>\n<body>\n<!-- to: {} -->\n{}\n</body></html>\n",
            html_escape::encode_text(&digest.subject),
            html_escape::encode_text(recipient),
            digest.html
        );
        fs::write(&path, page)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(recipient, path = %path.display(), "digest written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn announcement(title: &str, url: &str) -> Announcement {
        Announcement {
            id: 1,
            title: title.to_string(),
            url: url.to_string(),
            publish_date: "2024-03-01".to_string(),
            content: None,
            publisher: Some("深圳市生态环境局".to_string()),
            web_page_id: Some(1),
            web_page_name: Some("深圳政府采购".to_string()),
            created_at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_opt(8, 0, 0))
                .expect("created_at"),
        }
    }

    #[test]
    fn digest_lists_every_row_with_count_in_subject() {
        let rows = vec![
            announcement("生态环境局监测设备采购", "http://zfcg.szggzy.com:8081/gsgg/1.html"),
            announcement("水务局管网维护", "http://zfcg.szggzy.com:8081/gsgg/2.html"),
        ];
        let digest = render_digest(&rows).expect("digest");

        assert_eq!(digest.subject, "政府采购网公告通知 - 2条新公告");
        assert_eq!(digest.count, 2);
        assert_eq!(
            digest.html,
            "<h2>今日新增公告</h2><ul>\
             <li><a href='http://zfcg.szggzy.com:8081/gsgg/1.html'>生态环境局监测设备采购</a> - 2024-03-01</li>\
             <li><a href='http://zfcg.szggzy.com:8081/gsgg/2.html'>水务局管网维护</a> - 2024-03-01</li>\
             </ul>"
        );
    }

    #[test]
    fn digest_escapes_markup_and_skips_empty_days() {
        assert!(render_digest(&[]).is_none());

        let digest =
            render_digest(&[announcement("A<B>", "http://x.test/?a='1'")]).expect("digest");
        assert!(digest.html.contains("A&lt;B&gt;"));
        assert!(!digest.html.contains("'1'"));
    }

    #[tokio::test]
    async fn file_notifier_writes_one_page_per_recipient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let notifier = DigestFileNotifier::new(dir.path());
        let digest = render_digest(&[announcement("生态环境局采购", "http://x.test/1.html")])
            .expect("digest");

        notifier.notify("ops@example.com", &digest).await.expect("notify");

        let path = notifier.path_for("ops@example.com");
        assert!(path.starts_with(dir.path().join("digests")));
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("ops@example.com.html"));
        let written = std::fs::read_to_string(path).expect("read");
        assert!(written.contains("政府采购网公告通知 - 1条新公告"));
        assert!(written.contains(&digest.html));
    }
}
