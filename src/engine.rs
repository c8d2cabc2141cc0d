//! Request engine.
//!
//! Ties the pools, the transport, the hook registry, the cookie jar, the
//! statistics tracker and the soft-404 detector together behind a cheaply
//! cloneable [`Engine`] handle.
//!
//! Requests are queued into one of two pools: the async pool, drained in
//! waves of at most `max_concurrency` concurrent transfers by [`Engine::run`],
//! and the 1-wide sync pool, drained immediately by the submitting call.
//! Completion processing (statistics, hooks, cookies, callbacks) always
//! happens on the task driving the drain, one response at a time.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use http::header::{ACCEPT, COOKIE, FROM, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::{ConfigError, EngineConfig, ProxySettings};
use crate::core::options::upsert;
use crate::core::pool::{AbortSignal, PendingRequest, RequestPool, execute};
use crate::core::{
	Request, RequestHandle, RequestOptions, ReqwestTransport, Response, Transport, TransportError,
};
use crate::modules::cookies::{Cookie, CookieJar, CookieStore, cookie_header};
use crate::modules::hooks::{
	HookKind, HookRegistry, QueueAction, dispatch_after_run, dispatch_complete,
	dispatch_new_cookies, dispatch_queue, guarded,
};
use crate::modules::metrics::Statistics;
use crate::modules::not_found::{Lookup, NotFoundConfig, NotFoundDetector, Resolution, normalize_path};

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine entry points. Transport failures are not among
/// them; those end up on the [`Response`].
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("no url given and no seed url configured")]
	MissingUrl,
	#[error("url parse error: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("request queue is full ({0} requests waiting for a drain)")]
	QueueFull(usize),
	#[error("http client initialisation failed: {0}")]
	Client(#[from] TransportError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
}

type JarFactory = Arc<dyn Fn() -> Box<dyn CookieStore> + Send + Sync>;

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
	config: EngineConfig,
	transport: Option<Arc<dyn Transport>>,
	jar_factory: Option<JarFactory>,
}

impl EngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			transport: None,
			jar_factory: None,
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_url(mut self, url: impl Into<String>) -> Self {
		self.config.url = Some(url.into());
		self
	}

	pub fn with_max_concurrency(mut self, concurrency: usize) -> Self {
		self.config.max_concurrency = concurrency.max(1);
		self
	}

	pub fn with_redirect_limit(mut self, limit: usize) -> Self {
		self.config.redirect_limit = limit;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.user_agent = user_agent.into();
		self
	}

	pub fn with_authed_by(mut self, authed_by: impl Into<String>) -> Self {
		self.config.authed_by = Some(authed_by.into());
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.config.custom_headers.insert(name.into(), value.into());
		self
	}

	pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.config.cookies.insert(name.into(), value.into());
		self
	}

	pub fn with_cookie_string(mut self, cookies: impl Into<String>) -> Self {
		self.config.cookie_string = Some(cookies.into());
		self
	}

	pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
		self.config.proxy = Some(proxy);
		self
	}

	pub fn with_max_queue_size(mut self, size: usize) -> Self {
		self.config.max_queue_size = size.max(1);
		self
	}

	pub fn with_not_found(mut self, config: NotFoundConfig) -> Self {
		self.config.not_found = config;
		self
	}

	/// Replace the default reqwest transport.
	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Use a custom cookie store. The factory is called again on
	/// [`Engine::reset`].
	pub fn with_cookie_store<F>(mut self, factory: F) -> Self
	where
		F: Fn() -> Box<dyn CookieStore> + Send + Sync + 'static,
	{
		self.jar_factory = Some(Arc::new(factory));
		self
	}

	pub fn build(self) -> EngineResult<Engine> {
		self.config.validate()?;
		let transport: Arc<dyn Transport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new(&self.config)?),
		};
		let jar_factory: JarFactory = match self.jar_factory {
			Some(factory) => factory,
			None => Arc::new(|| Box::new(CookieJar::new()) as Box<dyn CookieStore>),
		};
		Engine::from_parts(self.config, transport, jar_factory)
	}
}

impl Default for EngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Mutable state shared by every clone of an engine. Guarded by a single
/// mutex that is never held across an await point or a hook invocation.
struct EngineState {
	hooks: HookRegistry,
	jar: Box<dyn CookieStore>,
	stats: Statistics,
	detector: NotFoundDetector,
}

impl EngineState {
	fn new(config: &EngineConfig, jar_factory: &JarFactory, seed_url: Option<&Url>) -> Self {
		let mut jar = jar_factory();
		let seed_host = seed_url.and_then(Url::host_str);

		let mut cookies: Vec<Cookie> = config
			.cookies
			.iter()
			.map(|(name, value)| Cookie::new(name, value))
			.collect();
		if let Some(ref cookie_string) = config.cookie_string {
			cookies.extend(Cookie::parse_cookie_string(cookie_string));
		}
		if let Some(host) = seed_host {
			cookies = cookies
				.into_iter()
				.map(|cookie| cookie.with_domain(host))
				.collect();
		}
		jar.update(&cookies);

		Self {
			hooks: HookRegistry::new(),
			jar,
			stats: Statistics::new(),
			detector: NotFoundDetector::new(config.not_found.clone()),
		}
	}
}

/// State captured by [`Engine::sandbox`].
struct EngineSnapshot {
	hooks: HookRegistry,
	jar: Box<dyn CookieStore>,
	stats: Statistics,
}

struct EngineInner {
	config: EngineConfig,
	seed_url: Option<Url>,
	default_headers: HeaderMap,
	transport: Arc<dyn Transport>,
	jar_factory: JarFactory,
	state: Mutex<EngineState>,
	next_id: AtomicU64,
	queue_size: AtomicUsize,
	running: AtomicBool,
	abort: AbortSignal,
	async_pool: RequestPool,
	sync_pool: RequestPool,
	sync_lock: tokio::sync::Mutex<()>,
}

/// Clears the running flag when a wave ends, even if the driving future is
/// dropped half-way.
struct WaveGuard<'a> {
	inner: &'a EngineInner,
}

impl Drop for WaveGuard<'_> {
	fn drop(&mut self) {
		self.inner.queue_size.store(0, Ordering::Release);
		self.inner.running.store(false, Ordering::Release);
		self.inner
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.stats
			.finish_burst();
	}
}

/// Puts a sandbox snapshot back when dropped.
struct RestoreOnDrop<'a> {
	engine: &'a Engine,
	snapshot: Option<EngineSnapshot>,
}

impl Drop for RestoreOnDrop<'_> {
	fn drop(&mut self) {
		if let Some(snapshot) = self.snapshot.take() {
			self.engine.restore(snapshot);
		}
	}
}

/// Concurrent HTTP request engine.
#[derive(Clone)]
pub struct Engine {
	inner: Arc<EngineInner>,
}

/// Non-owning handle captured by probe callbacks, which live inside the
/// engine's own pools.
#[derive(Clone)]
struct WeakEngine {
	inner: Weak<EngineInner>,
}

impl WeakEngine {
	fn upgrade(&self) -> Option<Engine> {
		self.inner.upgrade().map(|inner| Engine { inner })
	}
}

impl fmt::Debug for Engine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Engine")
			.field("url", &self.inner.seed_url.as_ref().map(Url::as_str))
			.field("max_concurrency", &self.max_concurrency())
			.field("running", &self.is_running())
			.finish()
	}
}

impl Engine {
	/// Construct an engine with default configuration.
	pub fn new() -> EngineResult<Self> {
		EngineBuilder::new().build()
	}

	/// Obtain a builder to customise the engine.
	pub fn builder() -> EngineBuilder {
		EngineBuilder::new()
	}

	pub fn with_config(config: EngineConfig) -> EngineResult<Self> {
		EngineBuilder::new().with_config(config).build()
	}

	pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> EngineResult<Self> {
		EngineBuilder::new()
			.with_config(config)
			.with_transport(transport)
			.build()
	}

	fn from_parts(
		config: EngineConfig,
		transport: Arc<dyn Transport>,
		jar_factory: JarFactory,
	) -> EngineResult<Self> {
		let seed_url = config.seed_url()?;
		let default_headers = default_headers(&config)?;
		let state = EngineState::new(&config, &jar_factory, seed_url.as_ref());

		Ok(Self {
			inner: Arc::new(EngineInner {
				seed_url,
				default_headers,
				transport,
				jar_factory,
				state: Mutex::new(state),
				next_id: AtomicU64::new(1),
				queue_size: AtomicUsize::new(0),
				running: AtomicBool::new(false),
				abort: AbortSignal::default(),
				async_pool: RequestPool::new(config.max_concurrency),
				sync_pool: RequestPool::new(1),
				sync_lock: tokio::sync::Mutex::new(()),
				config,
			}),
		})
	}

	fn state(&self) -> MutexGuard<'_, EngineState> {
		self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn downgrade(&self) -> WeakEngine {
		WeakEngine {
			inner: Arc::downgrade(&self.inner),
		}
	}

	pub fn config(&self) -> &EngineConfig {
		&self.inner.config
	}

	/// Seed URL from the configuration.
	pub fn url(&self) -> Option<&Url> {
		self.inner.seed_url.as_ref()
	}

	/// Headers sent with every request unless overridden.
	pub fn headers(&self) -> &HeaderMap {
		&self.inner.default_headers
	}

	/// `true` while an async drain is in progress.
	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::Acquire)
	}

	pub fn max_concurrency(&self) -> usize {
		self.inner.async_pool.max_concurrency()
	}

	pub fn set_max_concurrency(&self, concurrency: usize) {
		self.inner.async_pool.set_max_concurrency(concurrency);
	}

	/// Submit a request. `None` (or an empty string) targets the seed URL.
	///
	/// Asynchronous requests wait in the async pool until the next
	/// [`run`](Self::run); synchronous ones have completed by the time this
	/// returns. When the amount of undrained requests reaches
	/// `max_queue_size` and no drain is in progress, the async pool is
	/// drained before returning.
	pub async fn request<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		let asynchronous = options.asynchronous;
		let handle = self.submit(url.into(), options)?;

		if self.emergency_drain_due() {
			log::info!("Request queue reached its maximum size, performing an emergency run.");
			self.drain_async(false).await;
		}

		if !asynchronous {
			self.drain_sync().await;
		}

		Ok(handle)
	}

	pub async fn get<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		self.request(url, options.method(Method::GET)).await
	}

	/// POST request; `params` are sent form-encoded.
	pub async fn post<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		self.request(url, options.method(Method::POST)).await
	}

	pub async fn trace<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		self.request(url, options.method(Method::TRACE)).await
	}

	/// GET request carrying `params` as cookies instead of query parameters.
	pub async fn cookie<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		mut options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		for (name, value) in std::mem::take(&mut options.params) {
			upsert(&mut options.cookies, name, value);
		}
		self.request(url, options.method(Method::GET)).await
	}

	/// GET request carrying `params` as headers instead of query parameters.
	pub async fn header<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		mut options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		for (name, value) in std::mem::take(&mut options.params) {
			upsert(&mut options.headers, name, value);
		}
		self.request(url, options.method(Method::GET)).await
	}

	/// Queue a request without awaiting anything, for use inside hooks and
	/// callbacks while a wave is running.
	///
	/// Synchronous requests queued this way are executed by the active wave
	/// or by the next drain. Outside of a wave, once `max_queue_size`
	/// requests are waiting, this fails with [`EngineError::QueueFull`]
	/// instead of growing the queue.
	pub fn queue<'a>(
		&self,
		url: impl Into<Option<&'a str>>,
		options: RequestOptions,
	) -> EngineResult<RequestHandle> {
		if !self.is_running() {
			let undrained = self.inner.queue_size.load(Ordering::Acquire);
			if undrained >= self.inner.config.max_queue_size {
				log::warn!("Refusing to queue request, {undrained} requests are waiting for a drain");
				return Err(EngineError::QueueFull(undrained));
			}
		}
		self.submit(url.into(), options)
	}

	fn emergency_drain_due(&self) -> bool {
		self.inner.queue_size.load(Ordering::Acquire) >= self.inner.config.max_queue_size
			&& !self.is_running()
	}

	fn submit(&self, url: Option<&str>, options: RequestOptions) -> EngineResult<RequestHandle> {
		let request = self.build_request(url, &options)?;
		let asynchronous = options.asynchronous;

		let on_queue = self.state().hooks.on_queue();
		let requests = dispatch_queue(&on_queue, request, asynchronous);

		let (sender, receiver) = mpsc::unbounded_channel();
		let mut ids = Vec::with_capacity(requests.len());
		for mut request in requests {
			request.id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
			ids.push(request.id);
			self.state().stats.record_queued();
			self.inner.queue_size.fetch_add(1, Ordering::AcqRel);

			log::debug!(
				"Queued request #{} {} {} (params: {:?}, train: {})",
				request.id,
				request.method,
				request.url,
				request.params,
				request.train
			);

			let pending = PendingRequest {
				request: Arc::new(request),
				callbacks: options.callbacks.clone(),
				notifier: Some(sender.clone()),
			};
			if asynchronous {
				self.inner.async_pool.push(pending);
			} else {
				self.inner.sync_pool.push(pending);
			}
		}

		Ok(RequestHandle::new(ids, receiver))
	}

	fn resolve_url(&self, url: Option<&str>) -> EngineResult<Url> {
		let raw = match url.map(str::trim).filter(|url| !url.is_empty()) {
			Some(raw) => raw,
			None => return self.inner.seed_url.clone().ok_or(EngineError::MissingUrl),
		};
		match Url::parse(raw) {
			Ok(url) => Ok(url),
			Err(url::ParseError::RelativeUrlWithoutBase) => match self.inner.seed_url {
				Some(ref seed) => Ok(seed.join(raw)?),
				None => Err(url::ParseError::RelativeUrlWithoutBase.into()),
			},
			Err(err) => Err(err.into()),
		}
	}

	fn build_request(&self, url: Option<&str>, options: &RequestOptions) -> EngineResult<Request> {
		let mut url = self.resolve_url(url)?;
		let method = options.method.clone().unwrap_or(Method::GET);

		// The URL query is folded into the parameters, explicit ones win.
		let mut params = options.params.clone();
		if method != Method::POST && url.query().is_some() {
			let mut merged: Vec<(String, String)> = url.query_pairs().into_owned().collect();
			for (name, value) in params {
				upsert(&mut merged, name, value);
			}
			params = merged;
			url.set_query(None);
		}

		let mut headers = self.inner.default_headers.clone();
		for (name, value) in &options.headers {
			let header_name = HeaderName::from_bytes(name.as_bytes())
				.map_err(|_| EngineError::InvalidHeader(name.clone()))?;
			headers.insert(header_name, header_value(name, value)?);
		}

		let mut cookies = Vec::new();
		if !options.no_cookie_jar {
			for cookie in self.state().jar.for_url(&url) {
				upsert(&mut cookies, cookie.name, cookie.value);
			}
		}
		for (name, value) in &options.cookies {
			upsert(&mut cookies, name.clone(), value.clone());
		}

		if !headers.contains_key(COOKIE) {
			let header = cookie_header(&cookies);
			if !header.is_empty() {
				headers.insert(COOKIE, header_value("cookie", &header)?);
			}
		} else if headers.get(COOKIE).is_some_and(|value| value.is_empty()) {
			headers.remove(COOKIE);
		}

		let mut request = Request::new(method, url)
			.with_headers(headers)
			.with_params(params)
			.with_timeout(options.timeout.unwrap_or_else(|| self.inner.config.request_timeout()))
			.with_follow_redirects(options.follow_redirects)
			.with_asynchronous(options.asynchronous)
			.with_train(options.train)
			.with_update_cookies(options.update_cookies);
		request.cookies = cookies;
		request.body = options.body.clone();
		Ok(request)
	}

	/// Drain the async pool and fire the after-run hooks.
	///
	/// Returns `false` if the wave was aborted. A call made while another
	/// drain is in progress returns `true` immediately.
	pub async fn run(&self) -> bool {
		if self.is_running() {
			return true;
		}

		self.drain_sync().await;
		// Another task may have started a wave since the check above.
		let Some(completed) = self.drain_async(true).await else {
			return true;
		};

		let (one_shot, persistent) = {
			let mut state = self.state();
			(state.hooks.take_after_run(), state.hooks.after_run_persistent())
		};
		dispatch_after_run(HookKind::AfterRun, &one_shot);
		dispatch_after_run(HookKind::AfterRunPersistent, &persistent);

		let mut state = self.state();
		state.detector.prune();
		state.stats.reset_burst();
		completed
	}

	/// Cancel the current async wave: pending requests are discarded and
	/// in-flight ones dropped without firing their hooks. Has no effect when
	/// no wave is running.
	pub fn abort(&self) {
		if self.is_running() {
			self.inner.abort.trigger();
		}
	}

	async fn drain_sync(&self) {
		let _exclusive = self.inner.sync_lock.lock().await;
		while let Some(pending) = self.inner.sync_pool.pop() {
			let (pending, response) = execute(self.inner.transport.clone(), pending).await;
			self.complete(pending, response);
		}
	}

	/// Returns `None` when another drain was already running and nothing was
	/// done, otherwise whether the wave ran to completion.
	async fn drain_async(&self, fresh_burst: bool) -> Option<bool> {
		if self.inner.running.swap(true, Ordering::AcqRel) {
			return None;
		}
		self.inner.abort.reset();
		{
			let mut state = self.state();
			if fresh_burst {
				state.stats.clear_burst_runtime();
			}
			state.stats.start_burst();
		}
		let _guard = WaveGuard { inner: &self.inner };

		Some(self.drive_wave().await)
	}

	/// Async transfers stay polled while the sync lane is being drained, so
	/// their timers never run against a stalled driver.
	async fn drive_wave(&self) -> bool {
		let mut in_flight = FuturesUnordered::new();
		let mut sync_lane: Option<BoxFuture<'_, ()>> = None;

		loop {
			if sync_lane.is_none() && !self.inner.sync_pool.is_empty() {
				sync_lane = Some(self.drain_sync().boxed());
			}

			let aborted = if self.inner.abort.is_triggered() {
				true
			} else {
				let limit = self.inner.async_pool.max_concurrency();
				while in_flight.len() < limit {
					match self.inner.async_pool.pop() {
						Some(pending) => in_flight.push(execute(self.inner.transport.clone(), pending)),
						None => break,
					}
				}
				if in_flight.is_empty() && sync_lane.is_none() {
					return true;
				}

				tokio::select! {
					biased;
					_ = self.inner.abort.triggered() => true,
					_ = async {
						match sync_lane.as_mut() {
							Some(drain) => drain.await,
							None => future::pending::<()>().await,
						}
					}, if sync_lane.is_some() => {
						sync_lane = None;
						false
					}
					Some((pending, response)) = in_flight.next() => {
						self.complete(pending, response);
						false
					}
				}
			};

			if aborted {
				drop(in_flight);
				// The sync lane is not part of the wave; let it finish.
				if let Some(drain) = sync_lane.take() {
					drain.await;
				}
				self.discard_wave();
				return false;
			}
		}
	}

	fn discard_wave(&self) {
		let dropped = self.inner.async_pool.clear();
		log::warn!("Wave aborted, discarded {dropped} pending requests");
		let resolutions = self.state().detector.discard_incomplete();
		deliver(resolutions);
	}

	fn complete(&self, pending: PendingRequest, response: Response) {
		let PendingRequest {
			request,
			callbacks,
			notifier,
		} = pending;
		let response = Arc::new(response);

		let on_complete = {
			let mut state = self.state();
			state
				.stats
				.record_response(response.start_transfer_time(), response.timed_out());
			state.hooks.on_complete()
		};
		dispatch_complete(&on_complete, &response);

		if request.update_cookies {
			self.parse_and_set_cookies(&response);
		}

		log::debug!(
			"Got response for request #{}: status {} from {}",
			request.id,
			response.status(),
			response.url()
		);
		match response.error() {
			Some(err) if err.is_timeout() => log::warn!("Request timed-out! -- ID# {}", request.id),
			Some(err) => log::debug!("Request #{} failed: {err}", request.id),
			None => {}
		}

		dispatch_complete(&callbacks, &response);

		if let Some(notifier) = notifier {
			let _ = notifier.send(response);
		}
	}

	/// Register an on-queue hook. It sees every submitted request together
	/// with its async flag and may keep it or replace it with any amount of
	/// requests.
	pub fn on_queue<F>(&self, hook: F)
	where
		F: Fn(&Request, bool) -> QueueAction + Send + Sync + 'static,
	{
		self.state().hooks.add_on_queue(Arc::new(hook));
	}

	pub fn on_complete<F>(&self, hook: F)
	where
		F: Fn(&Response) + Send + Sync + 'static,
	{
		self.state().hooks.add_on_complete(Arc::new(hook));
	}

	pub fn on_new_cookies<F>(&self, hook: F)
	where
		F: Fn(&[Cookie], &Response) + Send + Sync + 'static,
	{
		self.state().hooks.add_on_new_cookies(Arc::new(hook));
	}

	/// Fired once, after the next completed [`run`](Self::run).
	pub fn after_run<F>(&self, hook: F)
	where
		F: Fn() + Send + Sync + 'static,
	{
		self.state().hooks.add_after_run(Arc::new(hook));
	}

	/// Fired after every completed [`run`](Self::run).
	pub fn after_run_persistent<F>(&self, hook: F)
	where
		F: Fn() + Send + Sync + 'static,
	{
		self.state().hooks.add_after_run_persistent(Arc::new(hook));
	}

	pub fn cookies(&self) -> Vec<Cookie> {
		self.state().jar.cookies()
	}

	pub fn update_cookies(&self, cookies: &[Cookie]) {
		self.state().jar.update(cookies);
	}

	/// Merges the cookies set by `response` into the jar and notifies the
	/// on-new-cookies hooks. Returns the parsed cookies.
	pub fn parse_and_set_cookies(&self, response: &Response) -> Vec<Cookie> {
		let cookies = Cookie::from_response(response);
		if cookies.is_empty() {
			return cookies;
		}

		let hooks = {
			let mut state = self.state();
			state.jar.update(&cookies);
			state.hooks.on_new_cookies()
		};
		dispatch_new_cookies(&hooks, &cookies, response);
		cookies
	}

	pub fn request_count(&self) -> u64 {
		self.state().stats.request_count()
	}

	pub fn response_count(&self) -> u64 {
		self.state().stats.response_count()
	}

	pub fn time_out_count(&self) -> u64 {
		self.state().stats.time_out_count()
	}

	pub fn average_response_time(&self) -> Duration {
		self.state().stats.average_response_time()
	}

	pub fn responses_per_second(&self) -> u64 {
		self.state().stats.responses_per_second()
	}

	pub fn burst_runtime(&self) -> Duration {
		self.state().stats.burst_runtime()
	}

	pub fn burst_response_count(&self) -> u64 {
		self.state().stats.burst_response_count()
	}

	pub fn burst_response_time(&self) -> Duration {
		self.state().stats.burst_response_time()
	}

	/// Copy of every counter.
	pub fn statistics(&self) -> Statistics {
		self.state().stats.clone()
	}

	/// Re-initialise all state from the stored configuration. Request ids
	/// keep increasing across resets.
	pub fn reset(&self) {
		let fresh = EngineState::new(
			&self.inner.config,
			&self.inner.jar_factory,
			self.inner.seed_url.as_ref(),
		);
		let previous = std::mem::replace(&mut *self.state(), fresh);
		drop(previous);

		self.inner.async_pool.clear();
		self.inner.sync_pool.clear();
		self.inner.queue_size.store(0, Ordering::Release);
		self.inner
			.async_pool
			.set_max_concurrency(self.inner.config.max_concurrency);
	}

	fn snapshot(&self) -> EngineSnapshot {
		let state = self.state();
		EngineSnapshot {
			hooks: state.hooks.clone(),
			jar: state.jar.snapshot(),
			stats: state.stats.clone(),
		}
	}

	fn restore(&self, snapshot: EngineSnapshot) {
		let mut state = self.state();
		state.hooks = snapshot.hooks;
		state.jar = snapshot.jar;
		state.stats = snapshot.stats;
	}

	/// Runs `f` against this engine and puts hooks, cookies and counters back
	/// the way they were afterwards, even if `f` panics or is cancelled.
	pub async fn sandbox<F, Fut, T>(&self, f: F) -> T
	where
		F: FnOnce(Engine) -> Fut,
		Fut: Future<Output = T>,
	{
		let _restore = RestoreOnDrop {
			engine: self,
			snapshot: Some(self.snapshot()),
		};
		f(self.clone()).await
	}

	/// Checks whether `response` is a custom (soft) 404 page.
	///
	/// The first response seen for a directory triggers probing: random
	/// resources are queued and `callback` fires once their responses have
	/// been analyzed, which happens during the next wave. Later responses
	/// for an analyzed directory are answered right away.
	pub fn custom_not_found<F>(&self, response: &Response, callback: F)
	where
		F: FnOnce(bool) + Send + 'static,
	{
		let path = match normalize_path(response.url()) {
			Ok(path) => path,
			Err(err) => {
				log::debug!("Cannot fingerprint {}: {err}", response.url());
				let _ = guarded(HookKind::NotFoundVerdict, || callback(false));
				return;
			}
		};
		let body = response.text().into_owned();

		let probes = {
			let mut state = self.state();
			match state.detector.begin(&path) {
				Lookup::Analyzed => {
					let verdict = state.detector.classify(&path, &body);
					drop(state);
					let _ = guarded(HookKind::NotFoundVerdict, || callback(verdict));
					return;
				}
				Lookup::Probing => {
					state.detector.defer(&path, body, Box::new(callback));
					return;
				}
				Lookup::Fresh => {
					state.detector.defer(&path, body, Box::new(callback));
					state.detector.probe_urls(response.url())
				}
			}
		};

		log::debug!("Fingerprinting not-found responses for {path}");
		for (slot, probe) in probes {
			let issued = match probe {
				Ok(url) => self.queue_probe(&path, slot, &url),
				Err(err) => {
					log::debug!("Skipping not-found probe for {path}: {err}");
					0
				}
			};
			if issued != 1 {
				let resolutions = self.state().detector.adjust_expected(&path, 1, issued);
				deliver(resolutions);
			}
		}
	}

	fn queue_probe(&self, path: &str, slot: usize, url: &Url) -> usize {
		let engine = self.downgrade();
		let probe_path = path.to_string();
		let options = RequestOptions::new()
			.follow_redirects(true)
			.on_complete(move |response| {
				if let Some(engine) = engine.upgrade() {
					engine.record_probe(&probe_path, slot, response);
				}
			});

		match self.queue(url.as_str(), options) {
			Ok(handle) => handle.ids().len(),
			Err(err) => {
				log::debug!("Not-found probe {url} was not queued: {err}");
				0
			}
		}
	}

	/// A probe that failed in transport carries no body worth fingerprinting
	/// and is abandoned instead of recorded.
	fn record_probe(&self, path: &str, slot: usize, response: &Response) {
		let resolutions = match response.error() {
			Some(err) => {
				log::debug!("Not-found probe {} for {path} failed: {err}", response.url());
				self.state().detector.adjust_expected(path, 1, 0)
			}
			None => {
				let body = response.text();
				self.state().detector.record(path, slot, &body)
			}
		};
		deliver(resolutions);
	}

	/// Awaitable form of [`custom_not_found`](Self::custom_not_found).
	///
	/// Drives [`run`](Self::run) itself when no wave is active; otherwise
	/// waits for the running wave, up to the request timeout. Any failure to
	/// obtain a verdict yields `false`.
	pub async fn is_custom_not_found(&self, response: &Response) -> bool {
		let (sender, mut receiver) = oneshot::channel();
		self.custom_not_found(response, move |verdict| {
			let _ = sender.send(verdict);
		});

		if let Ok(verdict) = receiver.try_recv() {
			return verdict;
		}
		if !self.is_running() {
			self.run().await;
		}

		match tokio::time::timeout(self.inner.config.request_timeout(), receiver).await {
			Ok(Ok(verdict)) => verdict,
			_ => false,
		}
	}
}

fn deliver(resolutions: Vec<Resolution>) {
	for resolution in resolutions {
		let _ = guarded(HookKind::NotFoundVerdict, || resolution.deliver());
	}
}

/// CR and LF are percent-encoded so a value can never split the header.
fn header_value(name: &str, value: &str) -> EngineResult<HeaderValue> {
	let sanitized = value.replace('\r', "%0D").replace('\n', "%0A");
	HeaderValue::from_bytes(sanitized.as_bytes())
		.map_err(|_| EngineError::InvalidHeader(name.to_string()))
}

fn default_headers(config: &EngineConfig) -> EngineResult<HeaderMap> {
	let mut headers = HeaderMap::new();
	headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
	headers.insert(USER_AGENT, header_value("user-agent", &config.user_agent)?);
	if let Some(ref authed_by) = config.authed_by {
		headers.insert(FROM, header_value("from", authed_by)?);
	}
	for (name, value) in &config.custom_headers {
		let header_name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| EngineError::InvalidHeader(name.clone()))?;
		headers.insert(header_name, header_value(name, value)?);
	}
	Ok(headers)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::core::TransportResponse;
	use async_trait::async_trait;

	#[derive(Default)]
	struct StubTransport {
		seen: Mutex<Vec<Request>>,
	}

	impl StubTransport {
		fn seen(&self) -> Vec<Request> {
			self.seen.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl Transport for StubTransport {
		async fn perform(&self, request: &Request) -> Result<TransportResponse, TransportError> {
			self.seen.lock().unwrap().push(request.clone());
			Ok(TransportResponse::new(200, request.url.clone()).with_body("ok"))
		}
	}

	fn engine_with(config: EngineConfig) -> (Engine, Arc<StubTransport>) {
		let transport = Arc::new(StubTransport::default());
		let engine = Engine::with_transport(config, transport.clone()).unwrap();
		(engine, transport)
	}

	fn seeded() -> (Engine, Arc<StubTransport>) {
		engine_with(EngineConfig {
			url: Some("http://example.com/app/".into()),
			..EngineConfig::default()
		})
	}

	#[test]
	fn default_headers_include_accept_agent_and_from() {
		let (engine, _) = engine_with(EngineConfig {
			authed_by: Some("security@example.com".into()),
			..EngineConfig::default()
		});
		let headers = engine.headers();
		assert_eq!(headers[ACCEPT], DEFAULT_ACCEPT);
		assert!(headers[USER_AGENT].to_str().unwrap().starts_with("probe-engine/"));
		assert_eq!(headers[FROM], "security@example.com");
	}

	#[test]
	fn request_without_any_url_is_rejected_before_queueing() {
		let (engine, _) = engine_with(EngineConfig::default());
		let err = engine.queue(None, RequestOptions::new()).unwrap_err();
		assert!(matches!(err, EngineError::MissingUrl));
		assert_eq!(engine.request_count(), 0);
	}

	#[test]
	fn empty_url_falls_back_to_seed() {
		let (engine, _) = seeded();
		engine.queue("", RequestOptions::new()).unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.url.as_str(), "http://example.com/app/");
	}

	#[test]
	fn relative_urls_resolve_against_seed() {
		let (engine, _) = seeded();
		engine.queue("login.php", RequestOptions::new()).unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.url.as_str(), "http://example.com/app/login.php");
	}

	#[test]
	fn query_is_merged_into_params_for_get() {
		let (engine, _) = seeded();
		engine
			.queue(
				"http://example.com/search?q=old&page=2",
				RequestOptions::new().param("q", "new"),
			)
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.url.query(), None);
		assert_eq!(pending.request.param("q"), Some("new"));
		assert_eq!(pending.request.param("page"), Some("2"));
	}

	#[test]
	fn post_keeps_url_query() {
		let (engine, _) = seeded();
		engine
			.queue(
				"http://example.com/form?token=1",
				RequestOptions::new().method(Method::POST).param("name", "x"),
			)
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.url.query(), Some("token=1"));
		assert_eq!(pending.request.params.len(), 1);
	}

	#[test]
	fn jar_cookies_are_merged_under_explicit_ones() {
		let (engine, _) = engine_with(EngineConfig {
			url: Some("http://example.com/".into()),
			cookie_string: Some("session=abc; theme=dark".into()),
			..EngineConfig::default()
		});
		engine
			.queue(None, RequestOptions::new().cookie("theme", "light"))
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.headers[COOKIE], "session=abc;theme=light");

		engine
			.queue(None, RequestOptions::new().no_cookie_jar())
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert!(!pending.request.headers.contains_key(COOKIE));
	}

	#[test]
	fn explicit_cookie_header_wins_and_empty_one_is_dropped() {
		let (engine, _) = engine_with(EngineConfig {
			url: Some("http://example.com/".into()),
			cookie_string: Some("session=abc".into()),
			..EngineConfig::default()
		});
		engine
			.queue(None, RequestOptions::new().header("Cookie", "raw=1"))
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.headers[COOKIE], "raw=1");

		engine
			.queue(None, RequestOptions::new().header("Cookie", ""))
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert!(!pending.request.headers.contains_key(COOKIE));
	}

	#[test]
	fn header_values_cannot_inject_lines() {
		let (engine, _) = seeded();
		engine
			.queue(None, RequestOptions::new().header("X-Test", "a\r\nInjected: 1"))
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert_eq!(pending.request.headers["x-test"], "a%0D%0AInjected: 1");
	}

	#[tokio::test]
	async fn cookie_helper_params_become_cookies() {
		let (engine, _) = seeded();
		engine
			.cookie(None, RequestOptions::new().param("q", "<x> y"))
			.await
			.unwrap();
		let pending = engine.inner.async_pool.pop().unwrap();
		assert!(pending.request.params.is_empty());
		assert_eq!(pending.request.headers[COOKIE], "q=%3Cx%3E+y");
	}

	#[test]
	fn queue_refuses_to_grow_past_threshold_outside_a_wave() {
		let (engine, _) = engine_with(EngineConfig {
			url: Some("http://example.com/".into()),
			max_queue_size: 2,
			..EngineConfig::default()
		});
		engine.queue(None, RequestOptions::new()).unwrap();
		engine.queue(None, RequestOptions::new()).unwrap();
		assert!(matches!(
			engine.queue(None, RequestOptions::new()),
			Err(EngineError::QueueFull(2))
		));
	}

	#[test]
	fn ids_are_strictly_increasing_across_resets() {
		let (engine, _) = seeded();
		let first = engine.queue(None, RequestOptions::new()).unwrap().ids()[0];
		engine.reset();
		let second = engine.queue(None, RequestOptions::new()).unwrap().ids()[0];
		assert!(second > first);
		assert_eq!(engine.request_count(), 1);
	}

	#[tokio::test]
	async fn sync_request_completes_before_returning() {
		let (engine, transport) = seeded();
		let mut handle = engine
			.get(None, RequestOptions::new().synchronous())
			.await
			.unwrap();

		let response = handle.try_next_response().unwrap();
		assert_eq!(response.status(), 200);
		assert_eq!(transport.seen().len(), 1);
		assert_eq!(engine.response_count(), 1);
	}

	#[tokio::test]
	async fn reset_clears_hooks_and_pending_requests() {
		let (engine, transport) = seeded();
		let fired = Arc::new(AtomicUsize::new(0));
		let counter = fired.clone();
		engine.on_complete(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		engine.queue(None, RequestOptions::new()).unwrap();

		engine.reset();
		assert!(engine.run().await);

		assert_eq!(fired.load(Ordering::SeqCst), 0);
		assert!(transport.seen().is_empty());
		assert_eq!(engine.request_count(), 0);
	}

	#[tokio::test]
	async fn drain_does_nothing_while_another_wave_owns_the_pool() {
		let (engine, transport) = seeded();
		let fired = Arc::new(AtomicUsize::new(0));
		let counter = fired.clone();
		engine.after_run(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		engine.queue(None, RequestOptions::new()).unwrap();

		engine.inner.running.store(true, Ordering::Release);
		assert_eq!(engine.drain_async(true).await, None);
		assert!(transport.seen().is_empty());
		assert_eq!(fired.load(Ordering::SeqCst), 0);

		engine.inner.running.store(false, Ordering::Release);
		assert_eq!(engine.drain_async(true).await, Some(true));
		assert_eq!(transport.seen().len(), 1);
		assert!(!engine.is_running());
	}

	#[test]
	fn set_max_concurrency_is_clamped() {
		let (engine, _) = seeded();
		engine.set_max_concurrency(0);
		assert_eq!(engine.max_concurrency(), 1);
		engine.reset();
		assert_eq!(engine.max_concurrency(), 20);
	}
}
