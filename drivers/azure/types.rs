//! Azure Blob REST payloads

use serde::Deserialize;

/// `List Blobs` response / 列表响应
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnumerationResults {
    #[serde(default)]
    pub blobs: Blobs,
    #[serde(default)]
    pub next_marker: Option<String>,
}

impl EnumerationResults {
    /// Continuation marker, `None` on the last page
    pub fn marker(&self) -> Option<&str> {
        self.next_marker.as_deref().filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Blobs {
    #[serde(rename = "Blob", default)]
    pub blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
pub struct BlobItem {
    #[serde(rename = "Name")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="bucket">
  <Prefix>a/</Prefix>
  <MaxResults>2</MaxResults>
  <Blobs>
    <Blob><Name>a/1.txt</Name><Properties><Content-Length>3</Content-Length><BlobType>BlockBlob</BlobType></Properties></Blob>
    <Blob><Name>a/b/2.txt</Name><Properties><Content-Length>5</Content-Length></Properties></Blob>
  </Blobs>
  <NextMarker>2!72!MDAwMDA</NextMarker>
</EnumerationResults>"#;
        let page: EnumerationResults = quick_xml::de::from_str(xml).unwrap();
        let names: Vec<&str> = page.blobs.blob.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a/1.txt", "a/b/2.txt"]);
        assert_eq!(page.marker(), Some("2!72!MDAwMDA"));
    }

    #[test]
    fn test_parse_last_page() {
        let xml = r#"<EnumerationResults ContainerName="bucket"><Blobs></Blobs><NextMarker></NextMarker></EnumerationResults>"#;
        let page: EnumerationResults = quick_xml::de::from_str(xml).unwrap();
        assert!(page.blobs.blob.is_empty());
        assert_eq!(page.marker(), None);
    }
}
