//! Items route handlers with transparent response caching.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::cache::{CacheLayer, CacheSource, Payload, TagSet};

use super::keys::ItemsQueryKey;
use super::store::ItemStore;
use super::types::{ListQuery, NewItem};

/// A handler response: status code plus JSON body.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub body: Payload,
  /// Where a read response came from; writes are always `Bypass`
  pub source: CacheSource,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
  error: &'a str,
}

impl Response {
  fn json<T: Serialize>(status: u16, value: &T) -> Self {
    match encode(value) {
      Ok(body) => Self {
        status,
        body,
        source: CacheSource::Bypass,
      },
      Err(e) => Self::internal_error(e),
    }
  }

  fn error(status: u16, message: &str) -> Self {
    let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
    Self {
      status,
      body: Payload::from(body),
      source: CacheSource::Bypass,
    }
  }

  fn not_found(id: i64) -> Self {
    Self::error(404, &format!("Item {} not found", id))
  }

  fn internal_error(e: color_eyre::Report) -> Self {
    error!(error = %e, "Request failed");
    Self::error(500, "Internal server error")
  }

  fn no_content() -> Self {
    Self {
      status: 204,
      body: Payload::from(Vec::new()),
      source: CacheSource::Bypass,
    }
  }

  /// Decode the body as JSON.
  pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to decode response body: {}", e))
  }
}

fn encode<T: Serialize>(value: &T) -> Result<Payload> {
  serde_json::to_vec(value)
    .map(Payload::from)
    .map_err(|e| eyre!("Failed to serialize response: {}", e))
}

/// Items API handlers.
///
/// Reads consult the cache before the store; writes go to the store and then
/// invalidate every tag the store reports as affected. A router maps
/// `GET /items`, `GET /items/{id}`, `POST /items`, `PUT /items/{id}` and
/// `DELETE /items/{id}` onto these methods.
pub struct ItemsHandler<S: ?Sized> {
  store: Arc<S>,
  cache: CacheLayer,
}

impl<S: ?Sized> Clone for ItemsHandler<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      cache: self.cache.clone(),
    }
  }
}

impl<S: ItemStore + ?Sized + 'static> ItemsHandler<S> {
  pub fn new(store: Arc<S>, cache: CacheLayer) -> Self {
    Self { store, cache }
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  /// Run a store call on the blocking pool.
  async fn blocking<T, F>(&self, call: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let store = Arc::clone(&self.store);
    tokio::task::spawn_blocking(move || call(&*store))
      .await
      .map_err(|e| eyre!("Store task failed: {}", e))?
  }

  /// `GET /items?{query}`
  pub async fn list_items(&self, query: &str) -> Response {
    let query = match ListQuery::parse(query) {
      Ok(query) => query,
      Err(message) => return Response::error(400, &message),
    };
    let key = ItemsQueryKey::List(query.clone());

    let result = self
      .cache
      .fetch(&key, || async move {
        let items = self.blocking(move |store| store.list(&query)).await?;
        encode(&items).map(Some)
      })
      .await;

    match result {
      Ok(cached) => match cached.data {
        Some(body) => Response {
          status: 200,
          body,
          source: cached.source,
        },
        None => Response::internal_error(eyre!("List read produced no body")),
      },
      Err(e) => Response::internal_error(e),
    }
  }

  /// `GET /items/{id}`
  pub async fn get_item(&self, id: i64) -> Response {
    let key = ItemsQueryKey::Item(id);

    let result = self
      .cache
      .fetch(&key, || async move {
        match self.blocking(move |store| store.get(id)).await? {
          Some(item) => encode(&item).map(Some),
          None => Ok(None),
        }
      })
      .await;

    match result {
      Ok(cached) => match cached.data {
        Some(body) => Response {
          status: 200,
          body,
          source: cached.source,
        },
        None => Response::not_found(id),
      },
      Err(e) => Response::internal_error(e),
    }
  }

  /// `POST /items`
  pub async fn create_item(&self, body: &[u8]) -> Response {
    let item = match NewItem::from_json(body) {
      Ok(item) => item,
      Err(message) => return Response::error(400, &message),
    };

    match self.blocking(move |store| store.create(&item)).await {
      Ok((created, tags)) => {
        self.invalidate(&tags);
        Response::json(201, &created)
      }
      Err(e) => Response::internal_error(e),
    }
  }

  /// `PUT /items/{id}`
  pub async fn update_item(&self, id: i64, body: &[u8]) -> Response {
    let item = match NewItem::from_json(body) {
      Ok(item) => item,
      Err(message) => return Response::error(400, &message),
    };

    match self.blocking(move |store| store.update(id, &item)).await {
      Ok(Some((updated, tags))) => {
        self.invalidate(&tags);
        Response::json(200, &updated)
      }
      Ok(None) => Response::not_found(id),
      Err(e) => Response::internal_error(e),
    }
  }

  /// `DELETE /items/{id}`
  pub async fn delete_item(&self, id: i64) -> Response {
    match self.blocking(move |store| store.delete(id)).await {
      Ok(Some(tags)) => {
        self.invalidate(&tags);
        Response::no_content()
      }
      Ok(None) => Response::not_found(id),
      Err(e) => Response::internal_error(e),
    }
  }

  fn invalidate(&self, tags: &TagSet) {
    self.cache.invalidate(tags);
  }
}
