//! In-memory stand-in for the path manager: owns named paths, each with at
//! most one publisher and a fan-out stream of `Data` items to any number
//! of readers. Implements the path-manager contract the engine consumes.

use crate::auth::{AuthRequest, Authenticator, PathAuthConfig};
use crate::data::Data;
use crate::error::ConnError;
use crate::rtmp::framer::TrackList;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const STREAM_CAPACITY: usize = 1024;

pub struct Path {
    pub name: String,
    publisher: RwLock<Option<String>>,
    tracks: RwLock<Option<TrackList>>,
    stream_tx: broadcast::Sender<Data>,
    pub auth: PathAuthConfig,
    pub run_on_read: Option<String>,
}

impl Path {
    fn new(name: String, auth: PathAuthConfig, run_on_read: Option<String>) -> Self {
        let (stream_tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            name,
            publisher: RwLock::new(None),
            tracks: RwLock::new(None),
            stream_tx,
            auth,
            run_on_read,
        }
    }

    pub async fn tracks(&self) -> Option<TrackList> {
        self.tracks.read().await.clone()
    }

    pub fn publish(&self, item: Data) {
        // A fan-out stream with no subscribers is not an error: readers
        // come and go independently of the publisher's cadence.
        let _ = self.stream_tx.send(item);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Data> {
        self.stream_tx.subscribe()
    }

    async fn authenticate(&self, authenticator: &Authenticator, req: &AuthRequest) -> Result<(), ConnError> {
        authenticator.authenticate(&self.auth, req).await
    }
}

#[derive(Default, Clone)]
pub struct PathDefaults {
    pub auth: PathAuthConfig,
    pub run_on_read: Option<String>,
}

pub struct PathManager {
    paths: RwLock<HashMap<String, Arc<Path>>>,
    defaults: HashMap<String, PathDefaults>,
    authenticator: Authenticator,
}

impl PathManager {
    pub fn new(defaults: HashMap<String, PathDefaults>) -> Self {
        Self {
            paths: RwLock::new(HashMap::new()),
            defaults,
            authenticator: Authenticator::new(),
        }
    }

    fn defaults_for(&self, path_name: &str) -> PathDefaults {
        self.defaults.get(path_name).cloned().unwrap_or_default()
    }

    async fn get_or_create(&self, path_name: &str) -> Arc<Path> {
        if let Some(path) = self.paths.read().await.get(path_name) {
            return path.clone();
        }
        let mut paths = self.paths.write().await;
        paths
            .entry(path_name.to_string())
            .or_insert_with(|| {
                let defaults = self.defaults_for(path_name);
                Arc::new(Path::new(path_name.to_string(), defaults.auth, defaults.run_on_read))
            })
            .clone()
    }

    /// `onReaderSetupPlay`: authenticates and subscribes to the path's
    /// stream. Fails if the path has no publisher yet.
    pub async fn on_reader_setup_play(
        &self,
        req: &AuthRequest,
    ) -> Result<(Arc<Path>, broadcast::Receiver<Data>), ConnError> {
        let path = self.get_or_create(&req.path_name).await;
        if path.publisher.read().await.is_none() {
            return Err(ConnError::Setup(format!("path {} has no publisher", req.path_name)));
        }
        path.authenticate(&self.authenticator, req).await?;
        let rx = path.subscribe();
        Ok((path, rx))
    }

    /// `onPublisherAnnounce`: authenticates and claims the path's publisher
    /// slot for `author`.
    pub async fn on_publisher_announce(&self, author: &str, req: &AuthRequest) -> Result<Arc<Path>, ConnError> {
        let path = self.get_or_create(&req.path_name).await;
        {
            let existing = path.publisher.read().await;
            if existing.is_some() {
                return Err(ConnError::Setup(format!("path {} is already being published", req.path_name)));
            }
        }
        path.authenticate(&self.authenticator, req).await?;
        *path.publisher.write().await = Some(author.to_string());
        Ok(path)
    }

    /// `onPublisherRecord`: stores the negotiated track list, making the
    /// path live for readers.
    pub async fn on_publisher_record(&self, path: &Arc<Path>, tracks: TrackList) -> Result<(), ConnError> {
        *path.tracks.write().await = Some(tracks);
        Ok(())
    }

    pub async fn on_reader_play(&self, _path: &Arc<Path>, _author: &str) {}

    pub async fn on_reader_remove(&self, _path: &Arc<Path>, _author: &str) {}

    pub async fn on_publisher_remove(&self, path: &Arc<Path>, author: &str) {
        let mut publisher = path.publisher.write().await;
        if publisher.as_deref() == Some(author) {
            *publisher = None;
            *path.tracks.write().await = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Action;
    use std::net::{IpAddr, Ipv4Addr};

    fn req(path_name: &str) -> AuthRequest {
        AuthRequest {
            path_name: path_name.to_string(),
            action: Action::Publish,
            remote_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            query_user: String::new(),
            query_pass: String::new(),
            raw_query: String::new(),
        }
    }

    #[tokio::test]
    async fn reader_fails_before_any_publisher() {
        let manager = PathManager::new(HashMap::new());
        let err = manager.on_reader_setup_play(&req("live/test")).await.unwrap_err();
        assert!(matches!(err, ConnError::Setup(_)));
    }

    #[tokio::test]
    async fn publisher_then_reader_succeeds() {
        let manager = PathManager::new(HashMap::new());
        let path = manager.on_publisher_announce("pub-1", &req("live/test")).await.unwrap();
        manager.on_publisher_record(&path, TrackList::default()).await.unwrap();

        let (_path, _rx) = manager.on_reader_setup_play(&req("live/test")).await.unwrap();
    }

    #[tokio::test]
    async fn second_publisher_is_rejected() {
        let manager = PathManager::new(HashMap::new());
        let _path = manager.on_publisher_announce("pub-1", &req("live/test")).await.unwrap();
        let err = manager.on_publisher_announce("pub-2", &req("live/test")).await.unwrap_err();
        assert!(matches!(err, ConnError::Setup(_)));
    }

    #[tokio::test]
    async fn publisher_removal_frees_the_slot() {
        let manager = PathManager::new(HashMap::new());
        let path = manager.on_publisher_announce("pub-1", &req("live/test")).await.unwrap();
        manager.on_publisher_remove(&path, "pub-1").await;
        let path2 = manager.on_publisher_announce("pub-2", &req("live/test")).await.unwrap();
        assert!(Arc::ptr_eq(&path, &path2));
    }
}
