//! Shared test utilities: fixtures, recording fakes and arbitrary generators.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::Mutex;

use crate::gateway::{MergeError, MergeExecutor, PipelineCreator, PipelineError};
use crate::refresh::{CarRefresher, RefreshContext, RefreshError, RefreshResult};
use crate::store::{MemoryCarStore, StoreError};
use crate::types::{
    Car, CarId, MergeRequest, MergeRequestId, MergeRequestState, MergeStatus, Pipeline,
    PipelineId, PipelineStatus, ProjectId, Sha, TrainCar, TrainKey, User, UserId,
};

/// Installs a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

/// A deterministic SHA derived from `n`.
pub fn sha(n: u64) -> Sha {
    Sha::parse(format!("{:040x}", n)).unwrap()
}

/// An open, mergeable merge request with id `id` targeting `target_branch`.
pub fn merge_request(id: u64, target_branch: &str) -> MergeRequest {
    MergeRequest {
        id: MergeRequestId(id),
        project_id: ProjectId(1),
        source_branch: format!("feature-{id}"),
        target_branch: target_branch.to_string(),
        head_sha: sha(1_000_000 + id),
        state: MergeRequestState::Opened,
        merge_status: MergeStatus::CanBeMerged,
        draft: false,
    }
}

pub fn user(id: u64, can_merge: bool) -> User {
    User {
        id: UserId(id),
        username: format!("user{id}"),
        can_merge,
    }
}

/// A resolved car without a pipeline.
pub fn train_car(id: u64, key: &TrainKey) -> TrainCar {
    TrainCar {
        car: Car::new(CarId(id), MergeRequestId(id), key, UserId(1), id * 10),
        merge_request: merge_request(id, &key.target_branch),
        user: user(1, true),
        pipeline: None,
    }
}

/// A train in a [`MemoryCarStore`] backed by a [`FakeForge`].
pub struct TrainFixture {
    pub key: TrainKey,
    pub store: Arc<MemoryCarStore>,
    pub forge: Arc<FakeForge>,
}

impl TrainFixture {
    /// A train on project 1, branch `main`, whose head is `sha(1)`.
    pub fn new() -> Self {
        let key = TrainKey::new(1, "main");
        let store = Arc::new(MemoryCarStore::new());
        let forge = Arc::new(FakeForge::new(store.clone()).with_head(&key, sha(1)));
        TrainFixture { key, store, forge }
    }

    /// Queues merge request `id` at position `id * 10`.
    pub async fn add_car(&self, id: u64) -> CarId {
        self.store
            .upsert_merge_request(merge_request(id, &self.key.target_branch))
            .await;
        self.store.upsert_user(user(1, true)).await;
        let car = Car::new(CarId(id), MergeRequestId(id), &self.key, UserId(1), id * 10);
        let car_id = car.id;
        self.store.insert_car(car).await;
        car_id
    }

    /// Marks every pipeline created so far with `status`.
    pub async fn finish_pipelines(&self, status: PipelineStatus) {
        for created in self.forge.created().await {
            self.store.set_pipeline_status(created.id, status).await;
        }
    }

    pub async fn car_ids(&self) -> Vec<u64> {
        self.store
            .cars_in(&self.key)
            .await
            .iter()
            .map(|car| car.id.0)
            .collect()
    }
}

// ─── Fake forge ───────────────────────────────────────────────────────────────

/// A pipeline creation recorded by [`FakeForge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPipeline {
    pub id: PipelineId,
    pub ref_path: String,
    pub source_sha: Sha,
    pub target_sha: Sha,
}

#[derive(Debug, Default)]
struct ForgeState {
    heads: HashMap<(ProjectId, String), Sha>,
    created: Vec<CreatedPipeline>,
    prepared: Vec<(MergeRequestId, Sha)>,
    merged: Vec<MergeRequestId>,
    conflicts: HashSet<MergeRequestId>,
    failing_pipelines: HashSet<String>,
    rejected_merges: HashSet<MergeRequestId>,
}

/// Records pipeline creations and merges, and registers created pipelines in
/// the shared store so later passes can resolve them.
pub struct FakeForge {
    store: Arc<MemoryCarStore>,
    next_id: AtomicU64,
    state: Mutex<ForgeState>,
}

impl FakeForge {
    pub fn new(store: Arc<MemoryCarStore>) -> Self {
        FakeForge {
            store,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ForgeState::default()),
        }
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn with_head(mut self, key: &TrainKey, head: Sha) -> Self {
        self.state
            .get_mut()
            .heads
            .insert((key.target_project_id, key.target_branch.clone()), head);
        self
    }

    pub async fn set_head(&self, key: &TrainKey, head: Sha) {
        self.state
            .lock()
            .await
            .heads
            .insert((key.target_project_id, key.target_branch.clone()), head);
    }

    pub async fn head(&self, key: &TrainKey) -> Option<Sha> {
        self.state
            .lock()
            .await
            .heads
            .get(&(key.target_project_id, key.target_branch.clone()))
            .cloned()
    }

    pub async fn conflict_on(&self, mr: MergeRequestId) {
        self.state.lock().await.conflicts.insert(mr);
    }

    pub async fn fail_pipelines_for(&self, mr: MergeRequestId) {
        self.state
            .lock()
            .await
            .failing_pipelines
            .insert(format!("refs/merge-requests/{}/train", mr.0));
    }

    pub async fn reject_merge(&self, mr: MergeRequestId) {
        self.state.lock().await.rejected_merges.insert(mr);
    }

    pub async fn created(&self) -> Vec<CreatedPipeline> {
        self.state.lock().await.created.clone()
    }

    pub async fn prepared(&self) -> Vec<(MergeRequestId, Sha)> {
        self.state.lock().await.prepared.clone()
    }

    pub async fn merged(&self) -> Vec<MergeRequestId> {
        self.state.lock().await.merged.clone()
    }
}

impl PipelineCreator for FakeForge {
    async fn create_pipeline(
        &self,
        _project: ProjectId,
        ref_path: &str,
        source_sha: &Sha,
        target_sha: &Sha,
    ) -> Result<Pipeline, PipelineError> {
        {
            let state = self.state.lock().await;
            if state.failing_pipelines.contains(ref_path) {
                return Err(PipelineError::Rejected("no runners available".to_string()));
            }
        }

        let pipeline = Pipeline {
            id: PipelineId(self.next()),
            status: PipelineStatus::Running,
            ref_path: ref_path.to_string(),
            source_sha: source_sha.clone(),
            target_sha: target_sha.clone(),
        };
        self.store.upsert_pipeline(pipeline.clone()).await;
        self.state.lock().await.created.push(CreatedPipeline {
            id: pipeline.id,
            ref_path: pipeline.ref_path.clone(),
            source_sha: source_sha.clone(),
            target_sha: target_sha.clone(),
        });
        Ok(pipeline)
    }
}

impl MergeExecutor for FakeForge {
    async fn merge(&self, merge_request: &MergeRequest, _sha: &Sha) -> Result<Sha, MergeError> {
        let mut state = self.state.lock().await;
        if state.rejected_merges.contains(&merge_request.id) {
            return Err(MergeError::Rejected("head moved".to_string()));
        }
        let commit = sha(2_000_000 + self.next());
        state.heads.insert(
            (merge_request.project_id, merge_request.target_branch.clone()),
            commit.clone(),
        );
        state.merged.push(merge_request.id);
        Ok(commit)
    }

    async fn branch_head(&self, project: ProjectId, branch: &str) -> Result<Sha, MergeError> {
        self.state
            .lock()
            .await
            .heads
            .get(&(project, branch.to_string()))
            .cloned()
            .ok_or_else(|| MergeError::BranchNotFound(branch.to_string()))
    }

    async fn prepare_train_ref(
        &self,
        merge_request: &MergeRequest,
        _ref_path: &str,
        base: &Sha,
    ) -> Result<Sha, MergeError> {
        let mut state = self.state.lock().await;
        if state.conflicts.contains(&merge_request.id) {
            return Err(MergeError::Conflict);
        }
        state.prepared.push((merge_request.id, base.clone()));
        Ok(sha(3_000_000 + self.next()))
    }
}

// ─── Scripted refresher ───────────────────────────────────────────────────────

type RefreshHook = Box<dyn Fn(CarId) + Send + Sync>;

/// A [`CarRefresher`] that returns scripted results and records what it was
/// asked.
///
/// Unscripted cars wait on a train ref derived from their id.
#[derive(Default)]
pub struct ScriptedRefresher {
    script: HashMap<CarId, RefreshResult>,
    fatal: HashSet<CarId>,
    calls: Mutex<Vec<(CarId, RefreshContext)>>,
    delay: Option<Duration>,
    hook: Option<RefreshHook>,
}

impl ScriptedRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Runs `hook` before each car is evaluated.
    pub fn with_hook(mut self, hook: impl Fn(CarId) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn script(mut self, car: u64, result: RefreshResult) -> Self {
        self.script.insert(CarId(car), result);
        self
    }

    /// Makes `car` fail with a store error.
    pub fn fail_fatally(mut self, car: u64) -> Self {
        self.fatal.insert(CarId(car));
        self
    }

    pub async fn calls(&self) -> Vec<(CarId, RefreshContext)> {
        self.calls.lock().await.clone()
    }
}

impl CarRefresher for ScriptedRefresher {
    async fn refresh(
        &self,
        car: &TrainCar,
        ctx: &RefreshContext,
    ) -> Result<RefreshResult, RefreshError> {
        let id = car.car.id;
        if let Some(hook) = &self.hook {
            hook(id);
        }
        self.calls.lock().await.push((id, ctx.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fatal.contains(&id) {
            return Err(RefreshError::Store(StoreError::Backend(
                "connection reset".to_string(),
            )));
        }
        Ok(self
            .script
            .get(&id)
            .cloned()
            .unwrap_or_else(|| RefreshResult::waiting(Some(sha(id.0)))))
    }
}

// ─── Generators ───────────────────────────────────────────────────────────────

pub fn arb_sha() -> impl Strategy<Value = Sha> {
    "[0-9a-f]{40}".prop_map(|s| Sha::parse(s).unwrap())
}

pub fn arb_branch_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9/._-]{0,40}".prop_map(String::from)
}

pub fn arb_train_key() -> impl Strategy<Value = TrainKey> {
    (any::<u64>(), arb_branch_name()).prop_map(|(p, b)| TrainKey::new(p, b))
}

/// Between one and `max` car positions, possibly repeated, in arbitrary order.
pub fn arb_positions(max: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..10_000, 1..=max)
}

/// A refresh result as the refresher might produce it.
pub fn arb_refresh_result() -> impl Strategy<Value = RefreshResult> {
    prop_oneof![
        proptest::option::of(arb_sha()).prop_map(RefreshResult::waiting),
        arb_sha().prop_map(RefreshResult::pipeline_created),
        Just(RefreshResult::merged()),
        Just(RefreshResult::dropped(crate::types::DropReason::Conflict)),
    ]
}
