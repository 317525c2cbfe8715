use crate::{
    error::{self, is_certificate_error, NefError},
    provider::Provider,
    types::*,
};

use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::ResultExt;
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Page size used when listing collections.
const PAGE_LIMIT: usize = 100;
/// Interval between two polls of an asynchronous job.
const JOB_POLL_PERIOD: Duration = Duration::from_secs(1);

// REST API URI names for API objects.
mod uri {
    pub const LOGIN: &str = "auth/login";
    pub const VOLUME_GROUPS: &str = "storage/volumeGroups";
    pub const VOLUMES: &str = "storage/volumes";
    pub const SNAPSHOTS: &str = "storage/snapshots";
    pub const LUN_MAPPINGS: &str = "san/lunMappings";
    pub const TARGETS: &str = "san/iscsi/targets";
    pub const REMOTE_INITIATORS: &str = "san/iscsi/remoteInitiators";
    pub const TARGET_GROUPS: &str = "san/targetgroups";
    pub const HOST_GROUPS: &str = "san/hostgroups";
}

/// Connection parameters of a single appliance node.
#[derive(Clone)]
pub struct RestArgs {
    pub address: String,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
    pub request_timeout: Duration,
    pub job_timeout: Duration,
}

impl std::fmt::Debug for RestArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestArgs")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish_non_exhaustive()
    }
}

/// Collections are wrapped in a `data` array.
#[derive(Deserialize)]
struct Collection<T> {
    data: Vec<T>,
}

/// Error body returned by the appliance.
#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct Link {
    rel: String,
    href: String,
}

#[derive(Deserialize)]
struct JobAccepted {
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

/// NexentaStor provider over the appliance REST API.
pub struct RestProvider {
    address: String,
    base_url: Url,
    client: Client,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
    job_timeout: Duration,
}

impl std::fmt::Debug for RestProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RestProvider({})", self.address)
    }
}

impl RestProvider {
    /// Build a provider for the appliance node at `args.address`. No request is sent.
    pub fn new(args: &RestArgs) -> Result<Self, NefError> {
        let address = args.address.trim().trim_end_matches('/').to_string();
        let base_url = Url::parse(&format!("{address}/")).context(error::InvalidAddress {
            address: address.clone(),
        })?;
        let client = Client::builder()
            .danger_accept_invalid_certs(args.insecure_skip_verify)
            .timeout(args.request_timeout)
            .build()
            .context(error::Client {
                address: address.clone(),
            })?;
        Ok(Self {
            address,
            base_url,
            client,
            username: args.username.clone(),
            password: args.password.clone(),
            token: Mutex::new(None),
            job_timeout: args.job_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, NefError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .context(error::InvalidAddress {
                address: format!("{}/{path}", self.address),
            })
    }

    fn transport_error(&self, method: &Method, url: &Url, source: reqwest::Error) -> NefError {
        if is_certificate_error(&source) {
            NefError::UnknownAuthority {
                address: self.address.clone(),
                message: source.to_string(),
            }
        } else {
            NefError::Request {
                method: method.to_string(),
                url: url.to_string(),
                source,
            }
        }
    }

    async fn login(&self) -> Result<String, NefError> {
        let url = self.url(uri::LOGIN)?;
        let response = self
            .client
            .post(url.clone())
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await
            .map_err(|source| self.transport_error(&Method::POST, &url, source))?;
        let body = Self::checked_body(response).await?;
        let login: LoginResponse =
            serde_json::from_value(body).context(error::Decode { url: url.to_string() })?;
        debug!(address = %self.address, "Logged in to NexentaStor");
        *self.token.lock() = Some(login.token.clone());
        Ok(login.token)
    }

    async fn token(&self) -> Result<String, NefError> {
        let cached = self.token.lock().clone();
        match cached {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    /// Map a non-success response into the appliance error, or return its JSON body.
    async fn checked_body(response: reqwest::Response) -> Result<Value, NefError> {
        let status = response.status();
        let bytes = response.bytes().await.unwrap_or_default();
        if status.is_success() {
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null));
        }
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap_or_default();
        Err(NefError::Response {
            status: status.as_u16(),
            code: body.code,
            message: if body.message.is_empty() {
                String::from_utf8_lossy(&bytes).to_string()
            } else {
                body.message
            },
        })
    }

    /// Send a request, logging in again once if the session expired and waiting for the
    /// completion of asynchronous jobs.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<Value, NefError> {
        let url = self.url(path)?;
        let mut relogged = false;
        loop {
            let token = self.token().await?;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .bearer_auth(token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            trace!(%method, %url, "NexentaStor request");
            let response = request
                .send()
                .await
                .map_err(|source| self.transport_error(&method, &url, source))?;

            match response.status() {
                StatusCode::UNAUTHORIZED if !relogged => {
                    relogged = true;
                    *self.token.lock() = None;
                    continue;
                }
                StatusCode::ACCEPTED => {
                    let body = Self::checked_body(response).await?;
                    return self.wait_job(&url, body).await;
                }
                _ => return Self::checked_body(response).await,
            }
        }
    }

    async fn wait_job(&self, url: &Url, accepted: Value) -> Result<Value, NefError> {
        let accepted: JobAccepted =
            serde_json::from_value(accepted).context(error::Decode { url: url.to_string() })?;
        let Some(monitor) = accepted.links.into_iter().find(|l| l.rel == "monitor") else {
            return Ok(Value::Null);
        };
        let deadline = tokio::time::Instant::now() + self.job_timeout;
        let job_url = self.url(&monitor.href)?;
        loop {
            let response = self
                .client
                .get(job_url.clone())
                .bearer_auth(self.token().await?)
                .send()
                .await
                .map_err(|source| self.transport_error(&Method::GET, &job_url, source))?;
            if response.status() != StatusCode::ACCEPTED {
                return Self::checked_body(response).await;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NefError::JobTimeout {
                    href: monitor.href,
                    timeout: self.job_timeout,
                });
            }
            tokio::time::sleep(JOB_POLL_PERIOD).await;
        }
    }

    async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, NefError> {
        let mut items = Vec::new();
        loop {
            let mut page_query = query.to_vec();
            page_query.push(("limit", PAGE_LIMIT.to_string()));
            page_query.push(("offset", items.len().to_string()));
            let body = self
                .send::<()>(Method::GET, path, &page_query, None)
                .await?;
            let page: Collection<T> =
                serde_json::from_value(body).context(error::Decode { url: path.to_string() })?;
            let count = page.data.len();
            items.extend(page.data);
            if count < PAGE_LIMIT {
                return Ok(items);
            }
        }
    }

    /// The single item matched by the query, ENOENT otherwise.
    async fn get_one<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<T, NefError> {
        let body = self.send::<()>(Method::GET, path, query, None).await?;
        let page: Collection<T> =
            serde_json::from_value(body).context(error::Decode { url: path.to_string() })?;
        page.data
            .into_iter()
            .next()
            .ok_or_else(|| NefError::not_exist(format!("{what} not found")))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), NefError> {
        self.send(Method::POST, path, &[], Some(body)).await.map(|_| ())
    }

    async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), NefError> {
        self.send(Method::PUT, path, &[], Some(body)).await.map(|_| ())
    }

    async fn delete(&self, path: &str, query: &[(&str, String)]) -> Result<(), NefError> {
        self.send::<()>(Method::DELETE, path, query, None)
            .await
            .map(|_| ())
    }
}

#[async_trait::async_trait]
impl Provider for RestProvider {
    fn address(&self) -> &str {
        &self.address
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_volume_group(&self, path: &str) -> Result<VolumeGroup, NefError> {
        let query = [
            ("path", path.to_string()),
            ("fields", "path,bytesAvailable,bytesUsed".to_string()),
        ];
        self.get_one(uri::VOLUME_GROUPS, &query, &format!("volume group '{path}'"))
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_volume(&self, path: &str) -> Result<Volume, NefError> {
        let query = [
            ("path", path.to_string()),
            ("fields", "path,volumeSize".to_string()),
        ];
        self.get_one(uri::VOLUMES, &query, &format!("volume '{path}'"))
            .await
    }

    async fn get_volumes(&self, parent: &str) -> Result<Vec<Volume>, NefError> {
        let query = [
            ("parent", parent.to_string()),
            ("fields", "path,volumeSize".to_string()),
        ];
        let mut volumes: Vec<Volume> = self.get_all(uri::VOLUMES, &query).await?;
        volumes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(volumes)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_volume(&self, params: CreateVolumeParams) -> Result<(), NefError> {
        self.post(uri::VOLUMES, &params).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn update_volume(&self, path: &str, params: UpdateVolumeParams) -> Result<(), NefError> {
        self.put(&format!("{}/{}", uri::VOLUMES, encode(path)), &params)
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn destroy_volume(
        &self,
        path: &str,
        params: DestroyVolumeParams,
    ) -> Result<(), NefError> {
        let query = [
            ("snapshots", params.destroy_snapshots.to_string()),
            (
                "promoteMostRecentCloneIfExists",
                params.promote_most_recent_clone_if_exists.to_string(),
            ),
        ];
        self.delete(&format!("{}/{}", uri::VOLUMES, encode(path)), &query)
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_snapshot(&self, path: &str) -> Result<Snapshot, NefError> {
        let query = [
            ("path", path.to_string()),
            ("fields", "path,name,parent,creationTime".to_string()),
        ];
        self.get_one(uri::SNAPSHOTS, &query, &format!("snapshot '{path}'"))
            .await
    }

    async fn get_snapshots(
        &self,
        parent: &str,
        recursive: bool,
    ) -> Result<Vec<Snapshot>, NefError> {
        let query = [
            ("parent", parent.to_string()),
            ("recursive", recursive.to_string()),
            ("fields", "path,name,parent,creationTime".to_string()),
        ];
        let mut snapshots: Vec<Snapshot> = self.get_all(uri::SNAPSHOTS, &query).await?;
        snapshots.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(snapshots)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_snapshot(&self, path: &str) -> Result<(), NefError> {
        self.post(uri::SNAPSHOTS, &json!({ "path": path })).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn destroy_snapshot(&self, path: &str) -> Result<(), NefError> {
        self.delete(&format!("{}/{}", uri::SNAPSHOTS, encode(path)), &[])
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn clone_snapshot(
        &self,
        path: &str,
        params: CloneSnapshotParams,
    ) -> Result<(), NefError> {
        self.post(
            &format!("{}/{}/clone", uri::SNAPSHOTS, encode(path)),
            &params,
        )
        .await
    }

    async fn get_lun_mappings(
        &self,
        filter: LunMappingFilter,
    ) -> Result<Vec<LunMapping>, NefError> {
        let mut query = vec![("fields", "id,volume,targetGroup,hostGroup,lun".to_string())];
        if let Some(volume) = &filter.volume {
            query.push(("volume", volume.clone()));
        }
        if let Some(target_group) = &filter.target_group {
            query.push(("targetGroup", target_group.clone()));
        }
        if let Some(host_group) = &filter.host_group {
            query.push(("hostGroup", host_group.clone()));
        }
        let mappings: Vec<LunMapping> = self.get_all(uri::LUN_MAPPINGS, &query).await?;
        // older releases ignore some of the filters
        Ok(mappings.into_iter().filter(|m| filter.matches(m)).collect())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_lun_mapping(&self, params: CreateLunMappingParams) -> Result<(), NefError> {
        self.post(uri::LUN_MAPPINGS, &params).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn destroy_lun_mapping(&self, id: &str) -> Result<(), NefError> {
        self.delete(&format!("{}/{}", uri::LUN_MAPPINGS, encode(id)), &[])
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_iscsi_target(&self, name: &str) -> Result<IscsiTarget, NefError> {
        let query = [("name", name.to_string())];
        self.get_one(uri::TARGETS, &query, &format!("iSCSI target '{name}'"))
            .await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_iscsi_target(&self, params: CreateIscsiTargetParams) -> Result<(), NefError> {
        self.post(uri::TARGETS, &params).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn update_iscsi_target(
        &self,
        name: &str,
        params: UpdateIscsiTargetParams,
    ) -> Result<(), NefError> {
        self.put(&format!("{}/{}", uri::TARGETS, encode(name)), &params)
            .await
    }

    async fn get_target_groups(&self) -> Result<Vec<TargetGroup>, NefError> {
        self.get_all(uri::TARGET_GROUPS, &[]).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_update_target_group(&self, params: GroupParams) -> Result<(), NefError> {
        match self.post(uri::TARGET_GROUPS, &params).await {
            Err(error) if error.is_already_exist() => {
                self.put(
                    &format!("{}/{}", uri::TARGET_GROUPS, encode(&params.name)),
                    &json!({ "members": params.members }),
                )
                .await
            }
            result => result,
        }
    }

    async fn get_host_groups(&self) -> Result<Vec<HostGroup>, NefError> {
        self.get_all(uri::HOST_GROUPS, &[]).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn create_host_group(&self, params: GroupParams) -> Result<(), NefError> {
        self.post(uri::HOST_GROUPS, &params).await
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_remote_initiator(&self, name: &str) -> Result<RemoteInitiator, NefError> {
        let body = self
            .send::<()>(
                Method::GET,
                &format!("{}/{}", uri::REMOTE_INITIATORS, encode(name)),
                &[],
                None,
            )
            .await?;
        serde_json::from_value(body).context(error::Decode {
            url: uri::REMOTE_INITIATORS.to_string(),
        })
    }

    #[instrument(level = "debug", skip(self, credentials), err)]
    async fn create_remote_initiator(
        &self,
        name: &str,
        credentials: ChapCredentials,
    ) -> Result<(), NefError> {
        self.post(
            uri::REMOTE_INITIATORS,
            &json!({
                "name": name,
                "chapUser": credentials.chap_user,
                "chapSecret": credentials.chap_secret,
            }),
        )
        .await
    }

    #[instrument(level = "debug", skip(self, credentials), err)]
    async fn update_remote_initiator(
        &self,
        name: &str,
        credentials: ChapCredentials,
    ) -> Result<(), NefError> {
        self.put(
            &format!("{}/{}", uri::REMOTE_INITIATORS, encode(name)),
            &credentials,
        )
        .await
    }
}
