//! Azure Blob Storage object store over the REST API
//!
//! Requests are signed with the account's Shared Key (HMAC-SHA256 over the
//! canonicalized request) or carry a SAS token, whichever the connection
//! string provides. Write-once semantics come from `If-None-Match: *` on
//! the block blob PUT.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::{Method, StatusCode, Url};
use sha2::Sha256;

use commentline_core::http::{error_from_response, http_client};
use commentline_core::{CancelToken, ServiceError, block_on_cancellable};

use crate::object_store::{ObjectStore, PutOutcome, validate_key};

type HmacSha256 = Hmac<Sha256>;

/// REST API version sent with every request
const API_VERSION: &str = "2021-08-06";

/// Azurite's published development account
const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// How requests are authorized
#[derive(Clone)]
pub enum Credential {
    SharedKey { account: String, key: Vec<u8> },
    /// SAS query string without the leading `?`
    Sas(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedKey { account, .. } => write!(f, "SharedKey({account})"),
            Self::Sas(_) => f.write_str("Sas(..)"),
        }
    }
}

/// Parsed `AZURE_STORAGE_CONNECTION_STRING`
#[derive(Debug, Clone)]
pub struct ConnectionString {
    /// Blob service endpoint without trailing slash
    pub blob_endpoint: String,
    pub credential: Credential,
}

impl ConnectionString {
    /// Parse `Key=Value;Key=Value` pairs.
    ///
    /// Understands `DefaultEndpointsProtocol`, `AccountName`, `AccountKey`,
    /// `EndpointSuffix`, `BlobEndpoint`, `SharedAccessSignature` and
    /// `UseDevelopmentStorage=true`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut protocol = "https".to_string();
        let mut account = None;
        let mut account_key = None;
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint = None;
        let mut sas = None;
        let mut dev = false;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                bail!("malformed connection string segment (expected Key=Value)");
            };
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "defaultendpointsprotocol" => protocol = value,
                "accountname" => account = Some(value),
                "accountkey" => account_key = Some(value),
                "endpointsuffix" => suffix = value,
                "blobendpoint" => blob_endpoint = Some(value),
                "sharedaccesssignature" => sas = Some(value),
                "usedevelopmentstorage" => dev = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if dev {
            return Ok(Self {
                blob_endpoint: blob_endpoint.unwrap_or_else(|| DEV_BLOB_ENDPOINT.to_string()),
                credential: Credential::SharedKey {
                    account: DEV_ACCOUNT.to_string(),
                    key: BASE64.decode(DEV_ACCOUNT_KEY)?,
                },
            });
        }

        let blob_endpoint = match (blob_endpoint, &account) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!("{protocol}://{account}.blob.{suffix}"),
            (None, None) => bail!("connection string has neither AccountName nor BlobEndpoint"),
        };

        let credential = match (account, account_key, sas) {
            (Some(account), Some(key), _) => Credential::SharedKey {
                account,
                key: BASE64
                    .decode(key.as_bytes())
                    .context("AccountKey is not valid base64")?,
            },
            (_, _, Some(sas)) => Credential::Sas(sas.trim_start_matches('?').to_string()),
            _ => bail!("connection string has neither AccountKey nor SharedAccessSignature"),
        };

        Ok(Self {
            blob_endpoint: blob_endpoint.trim_end_matches('/').to_string(),
            credential,
        })
    }
}

/// The standard headers that take part in Shared Key signing
#[derive(Debug, Default)]
struct SignedHeaders<'a> {
    content_length: usize,
    content_type: &'a str,
    if_none_match: &'a str,
    /// `x-ms-*` headers, lowercase names
    ms_headers: Vec<(&'static str, String)>,
}

/// Shared Key string-to-sign for a blob service request
fn string_to_sign(account: &str, method: &Method, url: &Url, headers: &SignedHeaders) -> String {
    // Zero length is sent as an empty string since version 2015-02-21
    let content_length = if headers.content_length == 0 {
        String::new()
    } else {
        headers.content_length.to_string()
    };
    let standard = [
        method.as_str(),
        "", // Content-Encoding
        "", // Content-Language
        &content_length,
        "", // Content-MD5
        headers.content_type,
        "", // Date (x-ms-date is used)
        "", // If-Modified-Since
        "", // If-Match
        headers.if_none_match,
        "", // If-Unmodified-Since
        "", // Range
    ];

    let mut out = standard.join("\n");
    out.push('\n');

    let mut ms_headers = headers.ms_headers.clone();
    ms_headers.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in &ms_headers {
        out.push_str(name);
        out.push(':');
        out.push_str(value.trim());
        out.push('\n');
    }

    out.push('/');
    out.push_str(account);
    out.push_str(url.path());

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
        .collect();
    params.sort();
    for (name, value) in params {
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&value);
    }
    out
}

fn sign(key: &[u8], string_to_sign: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(string_to_sign.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Percent-encode a blob key, keeping `/` separators
fn encode_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

/// One page of a container listing
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    names: Vec<String>,
    next_marker: Option<String>,
}

/// Parse the `EnumerationResults` XML of a List Blobs call
fn parse_list_response(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut buf = Vec::new();
    let mut in_blob = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"Blob" => in_blob = true,
                b"Name" if in_blob => {
                    let name = reader.read_text(e.name())?;
                    page.names.push(name.trim().to_string());
                }
                b"NextMarker" => {
                    let marker = reader.read_text(e.name())?;
                    let marker = marker.trim();
                    if !marker.is_empty() {
                        page.next_marker = Some(marker.to_string());
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"Blob" => in_blob = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(e).context("XML parse error"),
            _ => {}
        }
        buf.clear();
    }
    Ok(page)
}

/// Object store backed by one blob container.
pub struct AzureBlobStore {
    client: reqwest::Client,
    endpoint: String,
    container: String,
    credential: Credential,
}

impl AzureBlobStore {
    pub fn new(connection_string: &str, container: &str, timeout: Duration) -> Result<Self> {
        let conn = ConnectionString::parse(connection_string)
            .context("invalid AZURE_STORAGE_CONNECTION_STRING")?;
        if container.is_empty() {
            bail!("blob container name is empty");
        }
        Ok(Self {
            client: http_client(timeout)?,
            endpoint: conn.blob_endpoint,
            container: container.to_string(),
            credential: conn.credential,
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    fn blob_url(&self, key: &str) -> Result<Url, ServiceError> {
        validate_key(key)?;
        let raw = format!("{}/{}/{}", self.endpoint, self.container, encode_key(key));
        Url::parse(&raw).map_err(|e| ServiceError::InvalidResponse(format!("bad blob url: {e}")))
    }

    fn container_url(&self) -> Result<Url, ServiceError> {
        let raw = format!("{}/{}", self.endpoint, self.container);
        Url::parse(&raw).map_err(|e| ServiceError::InvalidResponse(format!("bad blob url: {e}")))
    }

    /// Build an authorized request. SAS tokens go in the query, Shared Key
    /// signs the final URL and headers.
    fn request(
        &self,
        method: Method,
        mut url: Url,
        mut headers: SignedHeaders,
    ) -> reqwest::RequestBuilder {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        headers.ms_headers.push(("x-ms-date", date));
        headers.ms_headers.push(("x-ms-version", API_VERSION.to_string()));

        let mut auth = None;
        match &self.credential {
            Credential::Sas(sas) => {
                let query = match url.query() {
                    Some(q) => format!("{q}&{sas}"),
                    None => sas.clone(),
                };
                url.set_query(Some(&query));
            }
            Credential::SharedKey { account, key } => {
                let to_sign = string_to_sign(account, &method, &url, &headers);
                auth = Some(format!("SharedKey {account}:{}", sign(key, &to_sign)));
            }
        }

        let mut req = self.client.request(method, url);
        for (name, value) in &headers.ms_headers {
            req = req.header(*name, value);
        }
        if !headers.content_type.is_empty() {
            req = req.header(reqwest::header::CONTENT_TYPE, headers.content_type);
        }
        if !headers.if_none_match.is_empty() {
            req = req.header(reqwest::header::IF_NONE_MATCH, headers.if_none_match);
        }
        if let Some(auth) = auth {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        req
    }

    fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<ListPage, ServiceError> {
        let mut url = self.container_url()?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("restype", "container");
            q.append_pair("comp", "list");
            if !prefix.is_empty() {
                q.append_pair("prefix", prefix);
            }
            if let Some(marker) = marker {
                q.append_pair("marker", marker);
            }
        }
        let req = self.request(Method::GET, url, SignedHeaders::default());
        block_on_cancellable(cancel, async move {
            let resp = req.send().await.map_err(ServiceError::from_reqwest)?;
            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }
            let body = resp.text().await.map_err(ServiceError::from_reqwest)?;
            parse_list_response(&body).map_err(|e| ServiceError::InvalidResponse(format!("{e:#}")))
        })
    }
}

impl ObjectStore for AzureBlobStore {
    fn describe(&self) -> String {
        format!("azure:{}/{}", self.endpoint, self.container)
    }

    fn put_if_absent(
        &self,
        key: &str,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<PutOutcome, ServiceError> {
        let url = self.blob_url(key)?;
        let headers = SignedHeaders {
            content_length: payload.len(),
            content_type: "application/json",
            if_none_match: "*",
            ms_headers: vec![("x-ms-blob-type", "BlockBlob".to_string())],
        };
        let req = self.request(Method::PUT, url, headers).body(payload.to_vec());
        block_on_cancellable(cancel, async move {
            let resp = req.send().await.map_err(ServiceError::from_reqwest)?;
            match resp.status() {
                StatusCode::CREATED => Ok(PutOutcome { written: true }),
                // BlobAlreadyExists / precondition on If-None-Match
                StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                    Ok(PutOutcome { written: false })
                }
                _ => Err(error_from_response(resp).await),
            }
        })
    }

    fn exists(&self, key: &str, cancel: &CancelToken) -> Result<bool, ServiceError> {
        let url = self.blob_url(key)?;
        let req = self.request(Method::HEAD, url, SignedHeaders::default());
        block_on_cancellable(cancel, async move {
            let resp = req.send().await.map_err(ServiceError::from_reqwest)?;
            match resp.status() {
                StatusCode::OK => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                _ => Err(error_from_response(resp).await),
            }
        })
    }

    fn get(&self, key: &str, cancel: &CancelToken) -> Result<Option<Vec<u8>>, ServiceError> {
        let url = self.blob_url(key)?;
        let req = self.request(Method::GET, url, SignedHeaders::default());
        block_on_cancellable(cancel, async move {
            let resp = req.send().await.map_err(ServiceError::from_reqwest)?;
            match resp.status() {
                StatusCode::OK => {
                    let bytes = resp.bytes().await.map_err(ServiceError::from_reqwest)?;
                    Ok(Some(bytes.to_vec()))
                }
                StatusCode::NOT_FOUND => Ok(None),
                _ => Err(error_from_response(resp).await),
            }
        })
    }

    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, ServiceError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_page(prefix, marker.as_deref(), cancel)?;
            log::debug!("list {prefix}: {} blobs", page.names.len());
            names.extend(page.names);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str = "DefaultEndpointsProtocol=https;AccountName=myacct;\
        AccountKey=c2VjcmV0LWtleQ==;EndpointSuffix=core.windows.net";

    #[test]
    fn parse_account_key_connection_string() {
        let conn = ConnectionString::parse(CONN).unwrap();
        assert_eq!(conn.blob_endpoint, "https://myacct.blob.core.windows.net");
        match conn.credential {
            Credential::SharedKey { account, key } => {
                assert_eq!(account, "myacct");
                assert_eq!(key, b"secret-key");
            }
            other => panic!("unexpected credential {other:?}"),
        }
    }

    #[test]
    fn parse_sas_connection_string() {
        let conn = ConnectionString::parse(
            "BlobEndpoint=https://x.blob.core.windows.net/;SharedAccessSignature=?sv=2021&sig=abc",
        )
        .unwrap();
        assert_eq!(conn.blob_endpoint, "https://x.blob.core.windows.net");
        assert!(matches!(conn.credential, Credential::Sas(ref s) if s == "sv=2021&sig=abc"));
    }

    #[test]
    fn parse_development_storage() {
        let conn = ConnectionString::parse("UseDevelopmentStorage=true").unwrap();
        assert_eq!(conn.blob_endpoint, DEV_BLOB_ENDPOINT);
        assert!(matches!(
            conn.credential,
            Credential::SharedKey { ref account, .. } if account == DEV_ACCOUNT
        ));
    }

    #[test]
    fn parse_rejects_incomplete() {
        assert!(ConnectionString::parse("AccountName=a").is_err());
        assert!(ConnectionString::parse("AccountKey=abc").is_err());
        assert!(ConnectionString::parse("garbage").is_err());
        assert!(ConnectionString::parse("AccountName=a;AccountKey=!!notbase64").is_err());
    }

    #[test]
    fn debug_hides_key() {
        let conn = ConnectionString::parse(CONN).unwrap();
        let dbg = format!("{conn:?}");
        assert!(!dbg.contains("c2VjcmV0"));
        assert!(dbg.contains("SharedKey(myacct)"));
    }

    #[test]
    fn string_to_sign_put_layout() {
        let url = Url::parse("https://myacct.blob.core.windows.net/box/comments/v/first/h.json")
            .unwrap();
        let headers = SignedHeaders {
            content_length: 12,
            content_type: "application/json",
            if_none_match: "*",
            ms_headers: vec![
                ("x-ms-version", API_VERSION.to_string()),
                ("x-ms-blob-type", "BlockBlob".to_string()),
                ("x-ms-date", "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            ],
        };
        let s = string_to_sign("myacct", &Method::PUT, &url, &headers);
        let expected = "PUT\n\n\n12\n\napplication/json\n\n\n\n*\n\n\n\
            x-ms-blob-type:BlockBlob\n\
            x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
            x-ms-version:2021-08-06\n\
            /myacct/box/comments/v/first/h.json";
        assert_eq!(s, expected);
    }

    #[test]
    fn string_to_sign_list_sorts_query() {
        let url = Url::parse(
            "https://myacct.blob.core.windows.net/box?restype=container&comp=list&prefix=comments%2Fv%2F",
        )
        .unwrap();
        let s = string_to_sign("myacct", &Method::GET, &url, &SignedHeaders::default());
        assert!(s.starts_with("GET\n\n\n\n\n\n\n\n\n\n\n\n"));
        assert!(s.ends_with("/myacct/box\ncomp:list\nprefix:comments/v/\nrestype:container"));
    }

    #[test]
    fn signature_is_deterministic_base64() {
        let a = sign(b"key", "payload");
        assert_eq!(a, sign(b"key", "payload"));
        assert_ne!(a, sign(b"other", "payload"));
        assert_eq!(BASE64.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn encode_key_keeps_separators() {
        assert_eq!(encode_key("a/b c/ä.json"), "a/b%20c/%C3%A4.json");
        assert_eq!(encode_key("comments/v-1_x/first/ab.json"), "comments/v-1_x/first/ab.json");
    }

    #[test]
    fn parse_list_xml() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://myacct.blob.core.windows.net/" ContainerName="box">
  <Prefix>comments/v/</Prefix>
  <Blobs>
    <Blob><Name>comments/v/first/a.json</Name><Properties><Content-Length>10</Content-Length></Properties></Blob>
    <Blob><Name>comments/v/p1/b.json</Name><Properties/></Blob>
  </Blobs>
  <NextMarker>2!abc</NextMarker>
</EnumerationResults>"#;
        let page = parse_list_response(xml).unwrap();
        assert_eq!(page.names, vec!["comments/v/first/a.json", "comments/v/p1/b.json"]);
        assert_eq!(page.next_marker.as_deref(), Some("2!abc"));
    }

    #[test]
    fn parse_list_xml_last_page() {
        let xml = "<EnumerationResults><Blobs/><NextMarker/></EnumerationResults>";
        let page = parse_list_response(xml).unwrap();
        assert!(page.names.is_empty());
        assert_eq!(page.next_marker, None);
    }

    #[test]
    #[ignore] // requires AZURE_STORAGE_CONNECTION_STRING and network
    fn live_put_and_exists() {
        let conn = std::env::var("AZURE_STORAGE_CONNECTION_STRING").unwrap();
        let store = AzureBlobStore::new(&conn, "youtube-comments", Duration::from_secs(30)).unwrap();
        let cancel = CancelToken::new();
        let key = format!("tests/{}.json", chrono::Utc::now().timestamp_nanos_opt().unwrap());
        assert!(store.put_if_absent(&key, b"{}", &cancel).unwrap().written);
        assert!(!store.put_if_absent(&key, b"{}", &cancel).unwrap().written);
        assert!(store.exists(&key, &cancel).unwrap());
    }
}
