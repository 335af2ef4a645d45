//! Desired StatefulSet for a cluster.
//!
//! Every member runs MySQL next to a Xenon agent and a backup sidecar; two
//! init containers prepare configuration and the data directory. Metrics
//! and log-tail containers are optional.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, HTTPGetAction, HostPathVolumeSource, Lifecycle, LifecycleHandler, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::cluster::{
    Cluster, ResourceKind, LABEL_HEALTHY, LABEL_ROLE, METRICS_PORT, MYSQL_PORT, SECRET_ROOT_PASSWORD,
    XENON_PORT,
};
use crate::syncer::storage::DATA_VOLUME;

pub const BACKUP_PORT: i32 = 8082;

// Volume names.
const CONF_VOLUME: &str = "mysql-conf";
const CONF_MAP_VOLUME: &str = "mysql-cm";
const LOGS_VOLUME: &str = "logs";
const SCRIPTS_VOLUME: &str = "scripts";
const XENON_VOLUME: &str = "xenon";
const XENON_META_VOLUME: &str = "xenon-meta";
const INIT_FILE_VOLUME: &str = "init-mysql";
const SYS_VOLUME: &str = "host-sys";
const LOCALTIME_VOLUME: &str = "localtime";
const TLS_VOLUME: &str = "tls";

// Mount paths.
const CONF_PATH: &str = "/etc/mysql";
const CONF_MAP_PATH: &str = "/mnt/mysql-cm";
const LOGS_PATH: &str = "/var/log/mysql";
const DATA_PATH: &str = "/var/lib/mysql";
const SCRIPTS_PATH: &str = "/scripts";
const XENON_PATH: &str = "/etc/xenon";
const XENON_META_PATH: &str = "/var/lib/xenon";
const INIT_FILE_PATH: &str = "/docker-entrypoint-initdb.d";
const SYS_PATH: &str = "/host-sys";
const LOCALTIME_PATH: &str = "/etc/localtime";
const TLS_PATH: &str = "/etc/mysql-ssl";

/// Build the workload the cluster should be running.
pub fn build_statefulset(cluster: &Cluster) -> StatefulSet {
    let spec = cluster.spec();

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(cluster.resource_name(ResourceKind::StatefulSet)),
            namespace: Some(cluster.namespace()),
            labels: Some(cluster.labels()),
            owner_references: cluster.owner_reference().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.replicas()),
            service_name: cluster.resource_name(ResourceKind::HeadlessService),
            selector: LabelSelector {
                match_labels: Some(cluster.selector_labels()),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels(cluster)),
                    annotations: Some(template_annotations(cluster)),
                    ..Default::default()
                }),
                spec: Some(pod_spec(cluster)),
            },
            volume_claim_templates: spec
                .persistence
                .enabled
                .then(|| vec![data_claim_template(cluster)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn template_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    let mut labels = cluster.labels();
    labels.extend(cluster.spec().pod_policy.labels.clone());
    labels.insert(LABEL_ROLE.to_string(), "candidate".to_string());
    labels.insert(LABEL_HEALTHY.to_string(), "no".to_string());
    labels
}

fn template_annotations(cluster: &Cluster) -> BTreeMap<String, String> {
    let mut annotations = cluster.spec().pod_policy.annotations.clone();
    if cluster.spec().metrics_opts.enabled {
        annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        annotations.insert("prometheus.io/port".to_string(), METRICS_PORT.to_string());
    }
    annotations
}

fn pod_spec(cluster: &Cluster) -> PodSpec {
    let spec = cluster.spec();
    let policy = &spec.pod_policy;

    let mut containers = vec![mysql_container(cluster), xenon_container(cluster), backup_container(cluster)];
    if spec.metrics_opts.enabled {
        containers.push(metrics_container(cluster));
    }
    if policy.slow_log_tail {
        containers.push(log_tail_container(cluster, "slowlog", "mysql-slow.log"));
    }
    if policy.audit_log_tail {
        containers.push(log_tail_container(cluster, "auditlog", "mysql-audit.log"));
    }

    PodSpec {
        init_containers: Some(vec![init_sidecar_container(cluster), init_mysql_container(cluster)]),
        containers,
        volumes: Some(volumes(cluster)),
        service_account_name: Some(cluster.resource_name(ResourceKind::ServiceAccount)),
        scheduler_name: policy.scheduler_name.clone(),
        priority_class_name: policy.priority_class_name.clone(),
        affinity: policy.affinity.clone(),
        tolerations: (!policy.tolerations.is_empty()).then(|| policy.tolerations.clone()),
        ..Default::default()
    }
}

fn data_claim_template(cluster: &Cluster) -> PersistentVolumeClaim {
    let persistence = &cluster.spec().persistence;
    // "-" selects the cluster default class explicitly.
    let storage_class = persistence.storage_class.as_ref().map(|class| {
        if class == "-" {
            String::new()
        } else {
            class.clone()
        }
    });

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(cluster.selector_labels()),
            owner_references: cluster.owner_reference().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(persistence.access_modes.clone()),
            storage_class_name: storage_class,
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(persistence.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Containers
// ============================================================================

fn init_sidecar_container(cluster: &Cluster) -> Container {
    let spec = cluster.spec();
    let secret = cluster.resource_name(ResourceKind::Secret);

    let mut env = vec![
        field_env("POD_HOSTNAME", "metadata.name"),
        value_env("NAMESPACE", &cluster.namespace()),
        value_env("SERVICE_NAME", &cluster.resource_name(ResourceKind::HeadlessService)),
        value_env("STATEFULSET_NAME", &cluster.resource_name(ResourceKind::StatefulSet)),
        value_env(
            "ADMIT_DEFEAT_HEARBEAT_COUNT",
            &spec.xenon_opts.admit_defeat_hearbeat_count.to_string(),
        ),
        value_env("ELECTION_TIMEOUT", &spec.xenon_opts.election_timeout.to_string()),
        value_env("MYSQL_VERSION", &spec.mysql_version),
        secret_env(&secret, "MYSQL_ROOT_PASSWORD", SECRET_ROOT_PASSWORD, false),
        secret_env(&secret, "MYSQL_REPL_USER", "replication-user", true),
        secret_env(&secret, "MYSQL_REPL_PASSWORD", "replication-password", true),
        secret_env(&secret, "METRICS_USER", "metrics-user", true),
        secret_env(&secret, "METRICS_PASSWORD", "metrics-password", true),
        secret_env(&secret, "OPERATOR_USER", "operator-user", true),
        secret_env(&secret, "OPERATOR_PASSWORD", "operator-password", true),
        secret_env(&secret, "BACKUP_USER", "backup-user", true),
        secret_env(&secret, "BACKUP_PASSWORD", "backup-password", true),
    ];
    if spec.mysql_opts.init_tokudb {
        env.push(value_env("INIT_TOKUDB", "1"));
    }

    let mut mounts = vec![
        mount(CONF_VOLUME, CONF_PATH),
        mount(CONF_MAP_VOLUME, CONF_MAP_PATH),
        mount(SCRIPTS_VOLUME, SCRIPTS_PATH),
        mount(XENON_VOLUME, XENON_PATH),
        mount(INIT_FILE_VOLUME, INIT_FILE_PATH),
    ];
    if spec.mysql_opts.init_tokudb {
        mounts.push(mount(SYS_VOLUME, SYS_PATH));
    }
    mounts.push(mount(DATA_VOLUME, DATA_PATH));

    Container {
        name: "init-sidecar".to_string(),
        image: Some(spec.pod_policy.sidecar_image.clone()),
        image_pull_policy: Some(spec.pod_policy.image_pull_policy.clone()),
        command: Some(vec!["sidecar".to_string(), "init".to_string()]),
        env: Some(env),
        resources: Some(spec.pod_policy.extra_resources.clone()),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

fn init_mysql_container(cluster: &Cluster) -> Container {
    let spec = cluster.spec();
    let secret = cluster.resource_name(ResourceKind::Secret);

    let mut env = vec![
        value_env("MYSQL_ALLOW_EMPTY_PASSWORD", "yes"),
        value_env("MYSQL_ROOT_HOST", "127.0.0.1"),
        value_env("MYSQL_INIT_ONLY", "1"),
        secret_env(&secret, "MYSQL_ROOT_PASSWORD", SECRET_ROOT_PASSWORD, false),
        secret_env(&secret, "MYSQL_DATABASE", "mysql-database", true),
        secret_env(&secret, "MYSQL_USER", "mysql-user", true),
        secret_env(&secret, "MYSQL_PASSWORD", "mysql-password", true),
    ];
    if spec.mysql_opts.init_tokudb {
        env.push(value_env("INIT_TOKUDB", "1"));
    }

    Container {
        name: "init-mysql".to_string(),
        image: Some(spec.mysql_opts.image.clone()),
        image_pull_policy: Some(spec.pod_policy.image_pull_policy.clone()),
        env: Some(env),
        resources: Some(spec.mysql_opts.resources.clone()),
        volume_mounts: Some(vec![
            mount(CONF_VOLUME, CONF_PATH),
            mount(DATA_VOLUME, DATA_PATH),
            mount(LOGS_VOLUME, LOGS_PATH),
            mount(INIT_FILE_VOLUME, INIT_FILE_PATH),
        ]),
        ..Default::default()
    }
}

fn mysql_container(cluster: &Cluster) -> Container {
    let spec = cluster.spec();

    let mut env = vec![
        value_env("NAMESPACE", &cluster.namespace()),
        field_env("POD_NAME", "metadata.name"),
        value_env("MAX_DELAY", &spec.mysql_opts.max_lag_seconds.to_string()),
    ];
    if spec.mysql_opts.init_tokudb {
        env.push(value_env("INIT_TOKUDB", "1"));
    }

    let mut mounts = vec![
        mount(CONF_VOLUME, CONF_PATH),
        mount(DATA_VOLUME, DATA_PATH),
        mount(LOGS_VOLUME, LOGS_PATH),
        mount(LOCALTIME_VOLUME, LOCALTIME_PATH),
    ];
    if spec.tls_secret_name.is_some() {
        mounts.push(mount(TLS_VOLUME, TLS_PATH));
    }

    Container {
        name: "mysql".to_string(),
        image: Some(spec.mysql_opts.image.clone()),
        image_pull_policy: Some(spec.pod_policy.image_pull_policy.clone()),
        command: Some(shell(
            "while [ -f '/var/lib/mysql/sleep-forever' ] ;do sleep 2 ; done; /docker-entrypoint.sh mysqld",
        )),
        env: Some(env),
        ports: Some(vec![port("mysql", MYSQL_PORT)]),
        resources: Some(spec.mysql_opts.resources.clone()),
        liveness_probe: Some(exec_probe(
            vec!["/usr/bin/bash".into(), "-c".into(), "/opt/radondb/mysqlchecker liveness".into()],
            30,
        )),
        readiness_probe: Some(exec_probe(
            vec!["/usr/bin/bash".into(), "-c".into(), "/opt/radondb/mysqlchecker readiness".into()],
            10,
        )),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

fn xenon_container(cluster: &Cluster) -> Container {
    let spec = cluster.spec();

    let hook = |phase: &str| LifecycleHandler {
        exec: Some(ExecAction {
            command: Some(vec!["/xenonchecker".to_string(), phase.to_string()]),
        }),
        ..Default::default()
    };

    Container {
        name: "xenon".to_string(),
        image: Some(spec.xenon_opts.image.clone()),
        image_pull_policy: Some(spec.pod_policy.image_pull_policy.clone()),
        env: Some(vec![
            value_env("NAMESPACE", &cluster.namespace()),
            field_env("POD_NAME", "metadata.name"),
            value_env("AUTO_REBUILD", &spec.xenon_opts.enable_auto_rebuild.to_string()),
        ]),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(hook("preStop")),
            post_start: Some(hook("postStart")),
            ..Default::default()
        }),
        ports: Some(vec![port("xenon", XENON_PORT)]),
        resources: Some(spec.xenon_opts.resources.clone()),
        liveness_probe: Some(exec_probe(shell("pgrep xenon && xenoncli xenon ping"), 30)),
        readiness_probe: Some(exec_probe(
            vec!["sh".into(), "-c".into(), "xenoncli xenon ping".into()],
            10,
        )),
        volume_mounts: Some(vec![
            mount(SCRIPTS_VOLUME, SCRIPTS_PATH),
            mount(XENON_VOLUME, XENON_PATH),
            mount(XENON_META_VOLUME, XENON_META_PATH),
            mount(LOCALTIME_VOLUME, LOCALTIME_PATH),
        ]),
        ..Default::default()
    }
}

fn backup_container(cluster: &Cluster) -> Container {
    let spec = cluster.spec();
    let secret = cluster.resource_name(ResourceKind::Secret);

    Container {
        name: "backup".to_string(),
        image: Some(spec.pod_policy.sidecar_image.clone()),
        image_pull_policy: Some(spec.pod_policy.image_pull_policy.clone()),
        command: Some(vec!["sidecar".to_string(), "http".to_string()]),
        env: Some(vec![
            value_env("NAMESPACE", &cluster.namespace()),
            value_env("SERVICE_NAME", &cluster.resource_name(ResourceKind::HeadlessService)),
            secret_env(&secret, "BACKUP_USER", "backup-user", true),
            secret_env(&secret, "BACKUP_PASSWORD", "backup-password", true),
        ]),
        ports: Some(vec![port("backup", BACKUP_PORT)]),
        resources: Some(spec.pod_policy.extra_resources.clone()),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::Int(BACKUP_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            ..probe_timing()
        }),
        volume_mounts: Some(vec![
            mount(CONF_VOLUME, CONF_PATH),
            mount(DATA_VOLUME, DATA_PATH),
            mount(LOGS_VOLUME, LOGS_PATH),
        ]),
        ..Default::default()
    }
}

fn metrics_container(cluster: &Cluster) -> Container {
    let spec = cluster.spec();
    let secret = cluster.resource_name(ResourceKind::Secret);

    Container {
        name: "metrics".to_string(),
        image: Some(spec.metrics_opts.image.clone()),
        image_pull_policy: Some(spec.pod_policy.image_pull_policy.clone()),
        env: Some(vec![secret_env(&secret, "DATA_SOURCE_NAME", "data-source", false)]),
        ports: Some(vec![port("metrics", METRICS_PORT)]),
        resources: Some(spec.metrics_opts.resources.clone()),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(METRICS_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            ..probe_timing()
        }),
        ..Default::default()
    }
}

fn log_tail_container(cluster: &Cluster, name: &str, file: &str) -> Container {
    let policy = &cluster.spec().pod_policy;

    Container {
        name: name.to_string(),
        image: Some(policy.busybox_image.clone()),
        image_pull_policy: Some(policy.image_pull_policy.clone()),
        command: Some(vec![
            "tail".to_string(),
            "-f".to_string(),
            format!("{}/{}", LOGS_PATH, file),
        ]),
        resources: Some(policy.extra_resources.clone()),
        volume_mounts: Some(vec![mount(LOGS_VOLUME, LOGS_PATH)]),
        ..Default::default()
    }
}

// ============================================================================
// Volumes
// ============================================================================

fn volumes(cluster: &Cluster) -> Vec<Volume> {
    let spec = cluster.spec();
    let mut volumes = Vec::new();

    if !spec.persistence.enabled {
        volumes.push(empty_dir(DATA_VOLUME));
    }
    if spec.mysql_opts.init_tokudb {
        volumes.push(Volume {
            name: SYS_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/sys/kernel/mm/transparent_hugepage".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes.extend([
        empty_dir(CONF_VOLUME),
        empty_dir(LOGS_VOLUME),
        Volume {
            name: CONF_MAP_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(cluster.resource_name(ResourceKind::ConfigMap)),
                ..Default::default()
            }),
            ..Default::default()
        },
        empty_dir(SCRIPTS_VOLUME),
        empty_dir(XENON_VOLUME),
        empty_dir(XENON_META_VOLUME),
        empty_dir(INIT_FILE_VOLUME),
        Volume {
            name: LOCALTIME_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: LOCALTIME_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]);

    if let Some(tls) = &spec.tls_secret_name {
        volumes.push(Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes
}

// ============================================================================
// Helpers
// ============================================================================

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn port(name: &str, number: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: number,
        ..Default::default()
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env(secret: &str, name: &str, key: &str, optional: bool) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: Some(optional),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn probe_timing() -> Probe {
    Probe {
        timeout_seconds: Some(5),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn exec_probe(command: Vec<String>, initial_delay_seconds: i32) -> Probe {
    Probe {
        exec: Some(ExecAction { command: Some(command) }),
        initial_delay_seconds: Some(initial_delay_seconds),
        ..probe_timing()
    }
}
