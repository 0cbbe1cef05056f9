//! Object store: bucket remoto (API JSON de Google Cloud Storage) o un
//! directorio local que hace de bucket.
//!
//! El cliente se construye una sola vez al arrancar el proceso y se pasa
//! explícitamente a quien lo necesite (enumerador, etapas de descarga/subida).

use reqwest::{
    blocking::{Client, RequestBuilder},
    Method, StatusCode, Url,
};
use serde::Deserialize;
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::error::ObjectStoreError;

pub const DEFAULT_GCS_BASE_URL: &str = "https://storage.googleapis.com";

const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

pub trait ObjectStore: Send + Sync {
    /// Claves (nombres completos) que empiezan con `prefix`, ordenadas.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    fn download(&self, key: &str, dest: &Path) -> Result<(), ObjectStoreError>;

    fn upload(&self, src: &Path, key: &str) -> Result<(), ObjectStoreError>;

    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

fn io_err(path: &Path, source: io::Error) -> ObjectStoreError {
    ObjectStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent(path: &Path) -> Result<(), ObjectStoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    Ok(())
}

/* =========================
   Directorio local como bucket
   ========================= */

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&self.root.to_string_lossy())
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| ObjectStoreError::InvalidUrl(format!("{pattern}: {e}")))?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            if !entry.is_file() {
                continue;
            }
            let Ok(rel) = entry.strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn download(&self, key: &str, dest: &Path) -> Result<(), ObjectStoreError> {
        let src = self.path_for(key);
        if !src.is_file() {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }
        ensure_parent(dest)?;
        fs::copy(&src, dest).map_err(|e| io_err(dest, e))?;
        Ok(())
    }

    fn upload(&self, src: &Path, key: &str) -> Result<(), ObjectStoreError> {
        let dest = self.path_for(key);
        ensure_parent(&dest)?;
        // copia + rename para que un lector nunca vea el objeto a medias
        let partial = dest.with_extension("upload-partial");
        fs::copy(src, &partial).map_err(|e| io_err(src, e))?;
        fs::rename(&partial, &dest).map_err(|e| io_err(&dest, e))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.path_for(key).is_file())
    }
}

/* =========================
   Bucket remoto (GCS JSON API)
   ========================= */

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: Url,
    bucket: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        bucket: &str,
        token: Option<String>,
    ) -> Result<Self, ObjectStoreError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ObjectStoreError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ObjectStoreError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            bucket: bucket.to_string(),
            token,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ObjectStoreError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ObjectStoreError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            // cada segmento se codifica entero: los '/' del nombre del objeto quedan como %2F
            path.extend(segments);
        }
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url, ObjectStoreError> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", key])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn check_status(key: &str, status: StatusCode) -> Result<(), ObjectStoreError> {
        if status == StatusCode::NOT_FOUND {
            Err(ObjectStoreError::NotFound(key.to_string()))
        } else if !status.is_success() {
            Err(ObjectStoreError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            })
        } else {
            Ok(())
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                query.append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let resp = self.request(Method::GET, url).send()?;
            Self::check_status(prefix, resp.status())?;
            let page: ListResponse = serde_json::from_slice(&resp.bytes()?)?;

            keys.extend(page.items.into_iter().map(|item| item.name));
            debug!("listado parcial de {}: {} objetos", prefix, keys.len());

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn download(&self, key: &str, dest: &Path) -> Result<(), ObjectStoreError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let mut resp = self.request(Method::GET, url).send()?;
        Self::check_status(key, resp.status())?;

        ensure_parent(dest)?;
        let mut file = File::create(dest).map_err(|e| io_err(dest, e))?;
        resp.copy_to(&mut file)?;
        debug!("descargado {} -> {}", key, dest.display());
        Ok(())
    }

    fn upload(&self, src: &Path, key: &str) -> Result<(), ObjectStoreError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);

        let file = File::open(src).map_err(|e| io_err(src, e))?;
        let resp = self
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(file)
            .send()?;
        Self::check_status(key, resp.status())?;
        debug!("subido {} -> {}", src.display(), key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let url = self.object_url(key)?;
        let resp = self.request(Method::GET, url).send()?;
        match Self::check_status(key, resp.status()) {
            Ok(()) => Ok(true),
            Err(ObjectStoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Lee el token de acceso de un archivo de credenciales.
///
/// Acepta un JSON con campo `access_token` o el token en texto plano.
pub fn read_access_token(path: &Path) -> Result<String, ObjectStoreError> {
    let raw = fs::read_to_string(path).map_err(|e| io_err(path, e))?;

    let token = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(obj)) => obj
            .get("access_token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Credentials {
                path: path.to_path_buf(),
                reason: "el JSON no tiene campo access_token".to_string(),
            })?,
        _ => raw.trim().to_string(),
    };

    if token.is_empty() {
        return Err(ObjectStoreError::Credentials {
            path: path.to_path_buf(),
            reason: "archivo vacío".to_string(),
        });
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("object_store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn local_store_lista_por_prefijo_y_ordena() {
        let dir = temp_dir("list");
        let store = LocalObjectStore::new(&dir);
        fs::create_dir_all(dir.join("mosaic/b")).unwrap();
        fs::create_dir_all(dir.join("other")).unwrap();
        fs::write(dir.join("mosaic/b/z.tif"), b"z").unwrap();
        fs::write(dir.join("mosaic/a.tif"), b"a").unwrap();
        fs::write(dir.join("other/c.tif"), b"c").unwrap();

        let keys = store.list("mosaic/").unwrap();
        assert_eq!(keys, vec!["mosaic/a.tif", "mosaic/b/z.tif"]);
    }

    #[test]
    fn local_store_upload_download_y_exists() {
        let dir = temp_dir("updown");
        let store = LocalObjectStore::new(dir.join("bucket"));
        let src = dir.join("src.tif");
        fs::write(&src, b"raster").unwrap();

        assert!(!store.exists("out/x_prob_v1.tif").unwrap());
        store.upload(&src, "out/x_prob_v1.tif").unwrap();
        assert!(store.exists("out/x_prob_v1.tif").unwrap());

        let dest = dir.join("copia").join("x.tif");
        store.download("out/x_prob_v1.tif", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"raster");

        assert!(matches!(
            store.download("no/existe.tif", &dest),
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[test]
    fn http_store_codifica_el_nombre_como_un_segmento() {
        let store = HttpObjectStore::new("https://storage.example.com/", "bucket", None).unwrap();
        let url = store.object_url("mosaic/region/L15-0001E-0002N.tif").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.example.com/storage/v1/b/bucket/o/mosaic%2Fregion%2FL15-0001E-0002N.tif"
        );
    }

    #[test]
    fn read_access_token_acepta_json_o_texto() {
        let dir = temp_dir("token");
        let json = dir.join("creds.json");
        let plain = dir.join("creds.txt");
        let empty = dir.join("empty.txt");
        fs::write(&json, r#"{"access_token": "abc"}"#).unwrap();
        fs::write(&plain, "xyz\n").unwrap();
        fs::write(&empty, "  \n").unwrap();

        assert_eq!(read_access_token(&json).unwrap(), "abc");
        assert_eq!(read_access_token(&plain).unwrap(), "xyz");
        assert!(read_access_token(&empty).is_err());
    }
}
