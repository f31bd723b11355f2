use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Instant;

use api_types::ConditionStatus;
use api_types::ContainerState;
use api_types::EnvVar;
use api_types::ExecAction;
use api_types::Handler;
use api_types::Lifecycle;
use api_types::Pod;
use api_types::PodPhase;
use api_types::PullPolicy;
use api_types::RestartPolicy;
use api_types::ObjectMeta;
use api_types::Service;
use api_types::ServicePort;
use api_types::ServiceSpec;
use api_types::CONFIG_MIRROR_ANNOTATION_KEY;
use similar_asserts::assert_eq;
use test_log::test;

use crate::container::hash_container;
use crate::container::pod_infra_container;
use crate::container::ContainerId;
use crate::container::ContainerName;
use crate::error::KubeletError;
use crate::error::Result;
use crate::pod_workers::PodSyncer;
use crate::runtime::memory::Operation;
use crate::runtime::CreateContainerRequest;
use crate::testing::container_name;
use crate::testing::container_name_with_hash;
use crate::testing::mirror_pod_of;
use crate::testing::new_test_kubelet;
use crate::testing::new_test_kubelet_with;
use crate::testing::running;
use crate::testing::static_pod;
use crate::testing::terminated;
use crate::testing::test_pod;
use crate::testing::TestKubelet;

const INFRA_ID: &str = "9876";

async fn sync(test: &TestKubelet, pods: Vec<Pod>) -> Result<()> {
    let result = test
        .kubelet
        .sync_pods(pods, &HashSet::new(), &HashMap::new(), Instant::now())
        .await;
    test.kubelet.pod_workers().wait_idle().await;
    result
}

fn decoded(names: Vec<String>) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| ContainerName::parse(name))
        .map(|name| name.container_name)
        .collect()
}

fn ids(ids: &[&str]) -> Vec<ContainerId> {
    ids.iter().map(|id| ContainerId::from(*id)).collect()
}

/// Seeds a running sandbox whose hash matches the current infra spec.
fn seed_infra(test: &TestKubelet, pod: &Pod) {
    let infra = pod_infra_container(pod, &test.kubelet.config().pod_infra_container_image);
    test.runtime.insert_container(
        INFRA_ID,
        &container_name_with_hash(pod, "POD", hash_container(&infra)),
        &infra.image,
        running(),
    );
}

/// Seeds a running instance of every container with its current hash.
fn seed_running_pod(test: &TestKubelet, pod: &Pod) {
    seed_infra(test, pod);
    for container in &pod.spec.containers {
        test.runtime.insert_container(
            &format!("{}-id", container.name),
            &container_name_with_hash(pod, &container.name, hash_container(container)),
            &container.image,
            running(),
        );
    }
}

#[test(tokio::test)]
async fn new_pod_gets_a_sandbox_then_its_containers() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);

    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(decoded(test.runtime.created()), vec!["POD", "bar"]);
    assert_eq!(
        test.runtime.pulled(),
        vec!["kubernetes/pause:latest".to_string(), "busybox".to_string()]
    );
    assert!(test.runtime.stopped().is_empty());

    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    assert_eq!(status.phase, PodPhase::Running);
    assert!(status.pod_ip.is_some());
    assert!(status.container_status("bar").unwrap().ready);
    assert_eq!(status.conditions[0].status, ConditionStatus::True);
}

#[test(tokio::test)]
async fn repeated_syncs_are_idempotent() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);

    sync(&test, vec![pod.clone()]).await.unwrap();
    sync(&test, vec![pod.clone()]).await.unwrap();
    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(test.runtime.created().len(), 2);
    assert!(test.runtime.stopped().is_empty());
}

#[test(tokio::test)]
async fn healthy_running_pod_is_left_alone() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_running_pod(&test, &pod);

    sync(&test, vec![pod]).await.unwrap();

    assert!(test.runtime.created().is_empty());
    assert!(test.runtime.stopped().is_empty());
    assert!(test.runtime.pulled().is_empty());
}

#[test(tokio::test)]
async fn missing_sandbox_restarts_the_whole_pod() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    test.runtime
        .insert_container("1234", &container_name(&pod, "bar"), "busybox", running());

    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(test.runtime.stopped(), ids(&["1234"]));
    assert_eq!(decoded(test.runtime.created()), vec!["POD", "bar"]);
}

#[test(tokio::test)]
async fn changed_sandbox_hash_restarts_the_whole_pod() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    test.runtime.insert_container(
        INFRA_ID,
        &container_name_with_hash(&pod, "POD", 42),
        "pause",
        running(),
    );
    test.runtime
        .insert_container("1234", &container_name(&pod, "bar"), "busybox", running());

    sync(&test, vec![pod]).await.unwrap();

    let mut stopped = test.runtime.stopped();
    stopped.sort();
    assert_eq!(stopped, ids(&["1234", INFRA_ID]));
    assert_eq!(decoded(test.runtime.created()), vec!["POD", "bar"]);
}

#[test(tokio::test)]
async fn changed_container_hash_replaces_only_that_container() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar", "baz"]);
    seed_infra(&test, &pod);
    test.runtime.insert_container(
        "1234",
        &container_name_with_hash(&pod, "bar", 12345),
        "busybox",
        running(),
    );
    test.runtime.insert_container(
        "5678",
        &container_name_with_hash(&pod, "baz", hash_container(&pod.spec.containers[1])),
        "busybox",
        running(),
    );

    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(test.runtime.stopped(), ids(&["1234"]));
    assert_eq!(decoded(test.runtime.created()), vec!["bar"]);
}

#[test(tokio::test)]
async fn unknown_hash_never_forces_a_restart() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_infra(&test, &pod);
    test.runtime
        .insert_container("1234", &container_name(&pod, "bar"), "busybox", running());

    sync(&test, vec![pod]).await.unwrap();

    assert!(test.runtime.created().is_empty());
    assert!(test.runtime.stopped().is_empty());
}

#[test(tokio::test)]
async fn duplicate_containers_keep_the_newest() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_infra(&test, &pod);
    test.runtime
        .insert_container("old", &container_name(&pod, "bar"), "busybox", running());
    test.runtime
        .insert_container("new", &container_name(&pod, "bar"), "busybox", running());

    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(test.runtime.stopped(), ids(&["old"]));
    assert!(test.runtime.created().is_empty());
}

#[test(tokio::test)]
async fn containers_not_in_the_spec_are_stopped() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_running_pod(&test, &pod);
    test.runtime
        .insert_container("stray", &container_name(&pod, "gone"), "busybox", running());

    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(test.runtime.stopped(), ids(&["stray"]));
}

#[test(tokio::test)]
async fn orphaned_pods_are_killed_once_sources_are_ready() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_running_pod(&test, &pod);
    test.sources_ready.store(false, Ordering::SeqCst);

    sync(&test, Vec::new()).await.unwrap();
    assert!(test.runtime.stopped().is_empty());

    test.sources_ready.store(true, Ordering::SeqCst);
    sync(&test, Vec::new()).await.unwrap();
    let mut stopped = test.runtime.stopped();
    stopped.sort();
    assert_eq!(stopped, ids(&[INFRA_ID, "bar-id"]));

    sync(&test, Vec::new()).await.unwrap();
    assert_eq!(test.runtime.stopped().len(), 2);
}

#[test(tokio::test)]
async fn deleted_pods_are_treated_as_orphans() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_running_pod(&test, &pod);

    test.kubelet
        .sync_pods(
            vec![pod],
            &HashSet::from(["12345678".to_string()]),
            &HashMap::new(),
            Instant::now(),
        )
        .await
        .unwrap();
    test.kubelet.pod_workers().wait_idle().await;

    assert_eq!(test.runtime.stopped().len(), 2);
    assert!(test.runtime.created().is_empty());
}

async fn sync_with_restart_policy(policy: RestartPolicy) -> (TestKubelet, Pod) {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["succeeded", "failed"]);
    pod.spec.restart_policy = policy;
    test.runtime
        .insert_container(INFRA_ID, &container_name(&pod, "POD"), "pause", running());
    test.runtime.insert_container(
        "1234",
        &container_name(&pod, "succeeded"),
        "busybox",
        terminated(0),
    );
    test.runtime
        .insert_container("5678", &container_name(&pod, "failed"), "busybox", terminated(42));

    sync(&test, vec![pod.clone()]).await.unwrap();
    (test, pod)
}

#[test(tokio::test)]
async fn restart_policy_always_restarts_every_exited_container() {
    let (test, _) = sync_with_restart_policy(RestartPolicy::Always).await;
    assert_eq!(decoded(test.runtime.created()), vec!["succeeded", "failed"]);
    assert!(test.runtime.stopped().is_empty());
}

#[test(tokio::test)]
async fn restart_policy_on_failure_restarts_failed_containers() {
    let (test, _) = sync_with_restart_policy(RestartPolicy::OnFailure).await;
    assert_eq!(decoded(test.runtime.created()), vec!["failed"]);
    assert!(test.runtime.stopped().is_empty());
}

#[test(tokio::test)]
async fn restart_policy_never_tears_down_the_sandbox() {
    let (test, pod) = sync_with_restart_policy(RestartPolicy::Never).await;
    assert!(test.runtime.created().is_empty());
    assert_eq!(test.runtime.stopped(), ids(&[INFRA_ID]));

    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    assert_eq!(status.phase, PodPhase::Failed);

    sync(&test, vec![pod]).await.unwrap();
    assert!(test.runtime.created().is_empty());
    assert_eq!(test.runtime.stopped().len(), 1);
}

#[test(tokio::test)]
async fn restart_count_survives_garbage_collection() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_infra(&test, &pod);
    test.runtime
        .insert_container("first", &container_name(&pod, "bar"), "busybox", terminated(1));
    test.runtime
        .insert_container("second", &container_name(&pod, "bar"), "busybox", terminated(1));
    test.runtime
        .insert_container("third", &container_name(&pod, "bar"), "busybox", running());

    test.kubelet.sync_pod(&pod, None).await.unwrap();
    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    assert_eq!(status.container_statuses[0].restart_count, 2);

    test.runtime.remove_container("first");
    test.runtime.remove_container("second");
    test.kubelet.sync_pod(&pod, None).await.unwrap();
    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    assert_eq!(status.container_statuses[0].restart_count, 2);
}

#[test(tokio::test)]
async fn unhealthy_containers_are_restarted() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_running_pod(&test, &pod);
    test.prober.mark_unhealthy("bar");

    sync(&test, vec![pod]).await.unwrap();

    assert_eq!(test.runtime.stopped(), ids(&["bar-id"]));
    assert_eq!(decoded(test.runtime.created()), vec!["bar"]);
}

#[test(tokio::test)]
async fn readiness_feeds_the_ready_condition() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_running_pod(&test, &pod);
    test.prober.mark_not_ready("bar");

    sync(&test, vec![pod]).await.unwrap();

    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    assert_eq!(status.phase, PodPhase::Running);
    assert!(!status.container_status("bar").unwrap().ready);
    assert_eq!(status.conditions[0].status, ConditionStatus::False);
}

#[test(tokio::test)]
async fn readiness_of_exited_containers_is_forgotten() {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar", "baz"]);
    pod.spec.restart_policy = RestartPolicy::Never;
    seed_running_pod(&test, &pod);

    sync(&test, vec![pod.clone()]).await.unwrap();
    assert!(test.kubelet.readiness().readiness(&ContainerId::from("bar-id")));

    test.runtime.exit_container("bar-id", 0);
    sync(&test, vec![pod]).await.unwrap();

    assert!(test.runtime.created().is_empty());
    assert!(!test.kubelet.readiness().readiness(&ContainerId::from("bar-id")));
    assert!(test.kubelet.readiness().readiness(&ContainerId::from("baz-id")));
}

#[test(tokio::test)]
async fn failure_reasons_of_removed_pods_are_purged() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_infra(&test, &pod);
    test.runtime.fail(Operation::Create, "no space left on device");

    assert!(test.kubelet.sync_pod(&pod, None).await.is_err());
    assert_eq!(test.kubelet.failure_reasons.len(), 1);

    test.runtime.clear_failures();
    sync(&test, Vec::new()).await.unwrap();

    assert!(test.kubelet.failure_reasons.is_empty());
}

fn exec_handler() -> Handler {
    Handler {
        exec: Some(ExecAction {
            command: vec!["true".to_string()],
        }),
        http_get: None,
    }
}

#[test(tokio::test)]
async fn failed_post_start_hook_kills_only_that_container() {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.containers[0].lifecycle = Some(Lifecycle {
        post_start: Some(exec_handler()),
        pre_stop: None,
    });
    seed_infra(&test, &pod);
    test.handler_runner.set_failing(true);

    let err = test.kubelet.sync_pod(&pod, None).await.unwrap_err();

    assert!(matches!(err, KubeletError::PostStartHook { .. }), "{err}");
    assert_eq!(decoded(test.runtime.created()), vec!["bar"]);
    let stopped = test.runtime.stopped();
    assert_eq!(stopped.len(), 1);
    assert_ne!(stopped[0], ContainerId::from(INFRA_ID));
    assert_eq!(test.handler_runner.calls()[0].0, stopped[0]);
}

#[test(tokio::test)]
async fn pre_stop_hook_runs_before_kill() {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.containers[0].lifecycle = Some(Lifecycle {
        post_start: None,
        pre_stop: Some(exec_handler()),
    });
    seed_infra(&test, &pod);
    test.runtime.insert_container(
        "1234",
        &container_name_with_hash(&pod, "bar", 12345),
        "busybox",
        running(),
    );

    test.kubelet.sync_pod(&pod, None).await.unwrap();

    assert_eq!(
        test.handler_runner.calls(),
        vec![(ContainerId::from("1234"), "bar".to_string())]
    );
    assert_eq!(test.runtime.stopped(), ids(&["1234"]));
}

async fn pulls_with_policy(policy: PullPolicy, present: bool) -> TestKubelet {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.containers[0].image_pull_policy = policy;
    seed_infra(&test, &pod);
    if present {
        test.runtime.add_image("busybox");
    }
    test.kubelet.sync_pod(&pod, None).await.unwrap();
    test
}

#[test(tokio::test)]
async fn pull_policy_decides_whether_images_are_pulled() {
    let test = pulls_with_policy(PullPolicy::Always, true).await;
    assert_eq!(test.runtime.pulled(), vec!["busybox".to_string()]);

    let test = pulls_with_policy(PullPolicy::IfNotPresent, true).await;
    assert!(test.runtime.pulled().is_empty());
    assert!(test.runtime.calls().contains(&"inspect_image".to_string()));

    let test = pulls_with_policy(PullPolicy::IfNotPresent, false).await;
    assert_eq!(test.runtime.pulled(), vec!["busybox".to_string()]);

    let test = pulls_with_policy(PullPolicy::Never, false).await;
    assert!(test.runtime.pulled().is_empty());
    assert!(!test.runtime.calls().contains(&"inspect_image".to_string()));
    assert_eq!(decoded(test.runtime.created()), vec!["bar"]);
}

#[test(tokio::test)]
async fn pull_failures_surface_as_waiting_reason() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_infra(&test, &pod);
    test.runtime.fail(Operation::Pull, "registry unreachable");

    let err = test.kubelet.sync_pod(&pod, None).await.unwrap_err();
    assert!(matches!(err, KubeletError::ImagePull { .. }), "{err}");

    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    match &status.container_status("bar").unwrap().state {
        ContainerState::Waiting(waiting) => assert!(waiting.reason.contains("registry unreachable")),
        other => panic!("expected waiting, got {other:?}"),
    }
}

#[test(tokio::test)]
async fn host_network_is_limited_to_allowed_sources() {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.host_network = true;

    let err = test.kubelet.sync_pod(&pod, None).await.unwrap_err();
    assert!(matches!(err, KubeletError::HostNetworkNotAllowed { .. }), "{err}");
    assert!(test.runtime.created().is_empty());

    let mut pod = static_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.host_network = true;
    test.kubelet.sync_pod(&pod, None).await.unwrap();
    assert_eq!(decoded(test.runtime.created()), vec!["POD", "bar"]);
}

#[test(tokio::test)]
async fn static_pods_get_a_mirror_and_no_upstream_status() {
    let test = new_test_kubelet();
    let pod = static_pod("12345678", "foo", "new", &["bar"]);

    test.kubelet.sync_pod(&pod, None).await.unwrap();

    assert_eq!(test.mirror_client.created().len(), 1);
    assert!(test.kubelet.status_manager().get_pod_status("foo_new").is_err());
    test.kubelet.status_manager().flush().await.unwrap();
    assert!(test.status_client.pushed().is_empty());
}

#[test(tokio::test)]
async fn outdated_mirror_is_deleted_not_recreated_in_the_same_pass() {
    let test = new_test_kubelet();
    let pod = static_pod("12345678", "foo", "new", &["bar"]);
    let mut mirror = mirror_pod_of(&pod);
    mirror
        .metadata
        .annotations
        .insert(CONFIG_MIRROR_ANNOTATION_KEY.to_string(), "stale".to_string());

    test.kubelet.sync_pod(&pod, Some(&mirror)).await.unwrap();

    assert_eq!(test.mirror_client.deleted(), vec!["foo_new".to_string()]);
    assert!(test.mirror_client.created().is_empty());

    test.kubelet
        .sync_pod(&pod, Some(&mirror_pod_of(&pod)))
        .await
        .unwrap();
    assert!(test.mirror_client.created().is_empty());
    assert_eq!(test.mirror_client.deleted().len(), 1);
}

#[test(tokio::test)]
async fn orphaned_mirrors_are_deleted_by_sync_pods() {
    let test = new_test_kubelet();
    let pod = static_pod("12345678", "foo", "new", &["bar"]);
    test.kubelet.pod_manager().set_pods(vec![mirror_pod_of(&pod)]);

    sync(&test, Vec::new()).await.unwrap();

    assert_eq!(test.mirror_client.deleted(), vec!["foo_new".to_string()]);
}

#[test(tokio::test)]
async fn rejected_pods_stay_failed_while_desired() {
    let test = new_test_kubelet();
    let mut first = test_pod("1", "first", "new", &["bar"]);
    let mut second = test_pod("2", "second", "new", &["bar"]);
    for (pod, secs) in [(&mut first, 100), (&mut second, 200)] {
        pod.spec.containers[0].ports = vec![api_types::ContainerPort {
            host_port: 8080,
            container_port: 80,
            ..Default::default()
        }];
        pod.metadata.creation_timestamp = chrono::DateTime::from_timestamp(secs, 0);
    }

    sync(&test, vec![first.clone(), second.clone()]).await.unwrap();
    sync(&test, vec![first, second]).await.unwrap();

    let status = test.kubelet.get_pod_status("second_new").await.unwrap();
    assert_eq!(status.phase, PodPhase::Failed);
    assert_eq!(test.kubelet.pod_workers().lane_count(), 1);
    assert_eq!(
        test.kubelet.get_pod_status("first_new").await.unwrap().phase,
        PodPhase::Running
    );
}

#[test(tokio::test)]
async fn orphaned_volumes_are_torn_down() {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.volumes = vec![api_types::Volume {
        name: "data".to_string(),
        source: api_types::VolumeSource::EmptyDir {},
    }];
    test.volume_mounter.add_mounted("gone", "cache");

    sync(&test, vec![pod.clone()]).await.unwrap();
    sync(&test, vec![pod]).await.unwrap();

    let torn_down = test.volume_mounter.torn_down();
    assert_eq!(torn_down.len(), 1);
    assert_eq!(torn_down[0].pod_uid, "gone");
    assert!(test.kubelet.volumes().volumes("12345678").is_some());
}

#[test(tokio::test)]
async fn pods_without_containers_get_no_sandbox() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &[]);

    sync(&test, vec![pod]).await.unwrap();

    assert!(test.runtime.created().is_empty());
    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    assert_eq!(status.conditions[0].status, ConditionStatus::True);
}

#[test(tokio::test)]
async fn runtime_listing_failures_fail_the_pass() {
    let test = new_test_kubelet();
    test.runtime.fail(Operation::List, "daemon unavailable");

    assert!(sync(&test, Vec::new()).await.is_err());
}

/// The create request of the container named `container_name`.
fn request_for(test: &TestKubelet, container_name: &str) -> CreateContainerRequest {
    test.runtime
        .requests()
        .into_iter()
        .find(|r| {
            ContainerName::parse(&r.name).is_some_and(|n| n.container_name == container_name)
        })
        .unwrap()
}

#[test(tokio::test)]
async fn termination_message_path_is_backed_by_a_host_file() {
    let test = new_test_kubelet();
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.containers[0].termination_message_path = Some("/dev/somepath".to_string());

    sync(&test, vec![pod]).await.unwrap();

    let request = request_for(&test, "bar");
    let (host_path, container_path) = request.binds[0].split_once(':').unwrap();
    assert_eq!(container_path, "/dev/somepath");
    let host_path = std::path::Path::new(host_path);
    assert_eq!(
        host_path.parent().unwrap(),
        test.kubelet.dirs().pod_container_dir("12345678", "bar")
    );
    assert_eq!(host_path.file_name().unwrap().to_str().unwrap(), request.name);
    assert!(request.name.starts_with("k8s_bar."));
    assert!(host_path.is_file());
    assert!(test.kubelet.dirs().pod_volumes_dir("12345678").is_dir());

    assert!(request_for(&test, "POD").binds.is_empty());
}

#[test(tokio::test)]
async fn containers_see_the_services_of_their_namespace() {
    let test = new_test_kubelet();
    test.services.set(vec![Service {
        metadata: ObjectMeta {
            name: "web".to_string(),
            namespace: "new".to_string(),
            ..Default::default()
        },
        spec: ServiceSpec {
            ports: vec![ServicePort {
                port: 80,
                ..Default::default()
            }],
            portal_ip: "10.0.0.5".to_string(),
        },
    }]);
    let mut pod = test_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.containers[0].env = vec![EnvVar {
        name: "WEB_SERVICE_PORT".to_string(),
        value: "8080".to_string(),
    }];

    sync(&test, vec![pod]).await.unwrap();

    let env = request_for(&test, "bar").env;
    assert_eq!(env[0], "WEB_SERVICE_PORT=8080");
    assert!(env.contains(&"WEB_SERVICE_HOST=10.0.0.5".to_string()));
    assert!(env.contains(&"WEB_PORT=tcp://10.0.0.5:80".to_string()));
    assert!(!env.contains(&"WEB_SERVICE_PORT=80".to_string()));
    assert!(request_for(&test, "POD").env.is_empty());
}

#[test(tokio::test)]
async fn service_listing_failures_surface_as_waiting_reason() {
    let test = new_test_kubelet();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);
    seed_infra(&test, &pod);
    test.services.set_failing(true);

    let err = test.kubelet.sync_pod(&pod, None).await.unwrap_err();
    assert!(matches!(err, KubeletError::ServiceEnvironment { .. }), "{err}");
    assert!(test.runtime.created().is_empty());

    let status = test.kubelet.get_pod_status("foo_new").await.unwrap();
    match &status.container_status("bar").unwrap().state {
        ContainerState::Waiting(waiting) => assert!(waiting.reason.contains("list services")),
        other => panic!("expected waiting, got {other:?}"),
    }
}

#[test(tokio::test)]
async fn sandboxes_get_the_cluster_resolvers() {
    let test = new_test_kubelet_with(|config| {
        config.cluster_dns = Some("10.0.0.10".parse().unwrap());
        config.cluster_domain = Some("cluster.local".to_string());
        config.resolver_config = Some(config.root_dir.join("resolv.conf"));
    });
    std::fs::write(
        test.root_dir.path().join("resolv.conf"),
        "nameserver 1.2.3.4\nsearch corp.example\n",
    )
    .unwrap();
    let pod = test_pod("12345678", "foo", "new", &["bar"]);

    sync(&test, vec![pod]).await.unwrap();

    let sandbox = request_for(&test, "POD");
    assert_eq!(sandbox.dns, vec!["10.0.0.10", "1.2.3.4"]);
    assert_eq!(
        sandbox.dns_search,
        vec!["new.cluster.local", "cluster.local", "corp.example"]
    );
    let container = request_for(&test, "bar");
    assert!(container.dns.is_empty());
    assert!(container.dns_search.is_empty());
}

#[test(tokio::test)]
async fn host_network_sandboxes_keep_the_host_resolvers() {
    let test = new_test_kubelet_with(|config| {
        config.cluster_dns = Some("10.0.0.10".parse().unwrap());
        config.cluster_domain = Some("cluster.local".to_string());
    });
    let mut pod = static_pod("12345678", "foo", "new", &["bar"]);
    pod.spec.host_network = true;

    test.kubelet.sync_pod(&pod, None).await.unwrap();

    let sandbox = request_for(&test, "POD");
    assert!(sandbox.dns.is_empty());
    assert!(sandbox.dns_search.is_empty());
}
