//! Cluster manifests for the four per-user resources.

use serde_json::{Value, json};

use crate::auth::ResourceQuota;
use crate::cluster::{ResourceKind, ResourceSpec};
use crate::config::EnvironmentConfig;
use crate::naming::{NOVNC_PORT, ResourceNames, SSH_PORT, VNC_PORT};

const NGINX: &str = "nginx.ingress.kubernetes.io";

const CORS_ALLOW_HEADERS: &str = "DNT,X-CustomHeader,Keep-Alive,User-Agent,X-Requested-With,\
If-Modified-Since,Cache-Control,Content-Type,Authorization";

fn metadata(name: &str, namespace: &str, names: &ResourceNames) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": names.labels(),
    })
}

fn spec(kind: ResourceKind, name: &str, names: &ResourceNames, manifest: Value) -> ResourceSpec {
    ResourceSpec {
        kind,
        name: name.to_string(),
        labels: names.labels(),
        manifest,
    }
}

pub fn storage_claim(
    names: &ResourceNames,
    namespace: &str,
    config: &EnvironmentConfig,
    quota: &ResourceQuota,
) -> ResourceSpec {
    let mut claim = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": quota.storage } },
    });
    if let Some(class) = &config.storage_class {
        claim["storageClassName"] = json!(class);
    }
    spec(
        ResourceKind::StorageClaim,
        &names.storage_claim,
        names,
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": metadata(&names.storage_claim, namespace, names),
            "spec": claim,
        }),
    )
}

/// Desktop pod. `password` becomes the VNC password inside the container.
pub fn compute_unit(
    names: &ResourceNames,
    namespace: &str,
    config: &EnvironmentConfig,
    quota: &ResourceQuota,
    password: &str,
) -> ResourceSpec {
    let probe = |initial: u32, period: u32, timeout: u32| {
        json!({
            "tcpSocket": { "port": VNC_PORT },
            "initialDelaySeconds": initial,
            "periodSeconds": period,
            "timeoutSeconds": timeout,
            "failureThreshold": 3,
        })
    };

    let container = json!({
        "name": "vnc",
        "image": config.image,
        "ports": [
            { "name": "vnc", "containerPort": VNC_PORT, "protocol": "TCP" },
            { "name": "novnc", "containerPort": NOVNC_PORT, "protocol": "TCP" },
            { "name": "ssh", "containerPort": SSH_PORT, "protocol": "TCP" },
        ],
        "env": [
            { "name": "USER_ID", "value": names.user_id },
            { "name": "VNC_PASSWORD", "value": password },
            { "name": "DISPLAY", "value": ":1" },
            { "name": "VNC_RESOLUTION", "value": "1920x1080" },
            { "name": "VNC_DEPTH", "value": "24" },
        ],
        "resources": {
            "requests": { "cpu": quota.cpu_request, "memory": quota.memory_request },
            "limits": { "cpu": quota.cpu_limit, "memory": quota.memory_limit },
        },
        "volumeMounts": [
            { "name": "user-data", "mountPath": "/home/void/workspace" },
            { "name": "shm", "mountPath": "/dev/shm" },
        ],
        "securityContext": {
            "capabilities": { "add": ["SYS_ADMIN"] },
            "runAsUser": 1000,
            "runAsGroup": 1000,
        },
        "livenessProbe": probe(30, 10, 5),
        "readinessProbe": probe(10, 5, 3),
    });

    spec(
        ResourceKind::ComputeUnit,
        &names.compute_unit,
        names,
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": metadata(&names.compute_unit, namespace, names),
            "spec": {
                "containers": [container],
                "volumes": [
                    {
                        "name": "user-data",
                        "persistentVolumeClaim": { "claimName": names.storage_claim },
                    },
                    {
                        "name": "shm",
                        "emptyDir": { "medium": "Memory", "sizeLimit": "2Gi" },
                    },
                ],
                "restartPolicy": "Always",
                "dnsPolicy": "ClusterFirst",
                "terminationGracePeriodSeconds": 30,
            },
        }),
    )
}

/// Internal service in front of the pod. With `direct_port` the service is a
/// NodePort and raw VNC is served on that port.
pub fn endpoint(names: &ResourceNames, namespace: &str, direct_port: Option<u16>) -> ResourceSpec {
    let mut vnc = json!({ "name": "vnc", "port": VNC_PORT, "targetPort": VNC_PORT, "protocol": "TCP" });
    let service_type = match direct_port {
        Some(port) => {
            vnc["nodePort"] = json!(port);
            "NodePort"
        }
        None => "ClusterIP",
    };

    spec(
        ResourceKind::Endpoint,
        &names.endpoint,
        names,
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(&names.endpoint, namespace, names),
            "spec": {
                "type": service_type,
                "selector": { "app": crate::naming::APP_LABEL, "user": names.user_id },
                "ports": [
                    vnc,
                    { "name": "novnc", "port": NOVNC_PORT, "targetPort": NOVNC_PORT, "protocol": "TCP" },
                    { "name": "ssh", "port": SSH_PORT, "targetPort": SSH_PORT, "protocol": "TCP" },
                ],
            },
        }),
    )
}

/// HTTP routing for the browser client and websocket bridge.
pub fn ingress(names: &ResourceNames, namespace: &str, config: &EnvironmentConfig) -> ResourceSpec {
    let user = &names.user_id;
    let path = |prefix: String, port: u16| {
        json!({
            "path": prefix,
            "pathType": "ImplementationSpecific",
            "backend": {
                "service": { "name": names.endpoint, "port": { "number": port } },
            },
        })
    };

    let annotations: serde_json::Map<String, Value> = [
        ("proxy-body-size", "0".to_string()),
        ("proxy-read-timeout", "3600".to_string()),
        ("proxy-send-timeout", "3600".to_string()),
        ("proxy-connect-timeout", "3600".to_string()),
        ("rewrite-target", "/$2".to_string()),
        ("websocket-services", names.endpoint.clone()),
        ("upstream-hash-by", "$remote_addr".to_string()),
        ("ssl-redirect", "false".to_string()),
        ("enable-cors", "true".to_string()),
        ("cors-allow-origin", "*".to_string()),
        ("cors-allow-methods", "GET, POST, OPTIONS".to_string()),
        ("cors-allow-headers", CORS_ALLOW_HEADERS.to_string()),
        ("use-regex", "true".to_string()),
        ("affinity", "cookie".to_string()),
        ("affinity-mode", "persistent".to_string()),
        ("session-cookie-name", names.affinity_cookie()),
        ("session-cookie-max-age", "86400".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (format!("{NGINX}/{k}"), Value::String(v)))
    .collect();

    let mut meta = metadata(&names.ingress, namespace, names);
    meta["annotations"] = Value::Object(annotations);

    spec(
        ResourceKind::Ingress,
        &names.ingress,
        names,
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": meta,
            "spec": {
                "ingressClassName": config.ingress_class,
                "rules": [{
                    "host": config.domain,
                    "http": {
                        "paths": [
                            path(format!("/user/{user}/novnc(/|$)(.*)"), NOVNC_PORT),
                            path(format!("/user/{user}/websockify(/|$)(.*)"), NOVNC_PORT),
                            path(format!("/user/{user}/vnc(/|$)(.*)"), VNC_PORT),
                            path(format!("/user/{user}(/|$)(.*)"), NOVNC_PORT),
                        ],
                    },
                }],
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ResourceNames {
        ResourceNames::for_user("42")
    }

    #[test]
    fn test_pod_carries_quota_and_password() {
        let quota = ResourceQuota {
            memory_limit: "8Gi".to_string(),
            ..ResourceQuota::default()
        };
        let pod = compute_unit(&names(), "vnc-pods", &EnvironmentConfig::default(), &quota, "pw123456");
        let container = &pod.manifest["spec"]["containers"][0];
        assert_eq!(container["resources"]["limits"]["memory"], "8Gi");
        assert_eq!(container["resources"]["requests"]["cpu"], "500m");
        assert_eq!(container["env"][1]["value"], "pw123456");
        assert_eq!(
            pod.manifest["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "pvc-42"
        );
        assert_eq!(pod.labels["managed-by"], "vnc-manager");
    }

    #[test]
    fn test_storage_class_optional() {
        let mut config = EnvironmentConfig::default();
        let claim = storage_claim(&names(), "ns", &config, &ResourceQuota::default());
        assert_eq!(claim.manifest["spec"]["storageClassName"], "183nfs");
        assert_eq!(claim.manifest["spec"]["resources"]["requests"]["storage"], "10Gi");

        config.storage_class = None;
        let claim = storage_claim(&names(), "ns", &config, &ResourceQuota::default());
        assert!(claim.manifest["spec"].get("storageClassName").is_none());
    }

    #[test]
    fn test_endpoint_type_follows_direct_port() {
        let internal = endpoint(&names(), "ns", None);
        assert_eq!(internal.manifest["spec"]["type"], "ClusterIP");
        assert!(internal.manifest["spec"]["ports"][0].get("nodePort").is_none());

        let direct = endpoint(&names(), "ns", Some(30123));
        assert_eq!(direct.manifest["spec"]["type"], "NodePort");
        assert_eq!(direct.manifest["spec"]["ports"][0]["nodePort"], 30123);
    }

    #[test]
    fn test_ingress_routes_and_affinity() {
        let ing = ingress(&names(), "ns", &EnvironmentConfig::default());
        let annotations = &ing.manifest["metadata"]["annotations"];
        assert_eq!(
            annotations["nginx.ingress.kubernetes.io/session-cookie-name"],
            "vnc-session-42"
        );
        assert_eq!(
            annotations["nginx.ingress.kubernetes.io/websocket-services"],
            "vnc-service-42"
        );

        let paths = ing.manifest["spec"]["rules"][0]["http"]["paths"]
            .as_array()
            .unwrap();
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[2]["path"], "/user/42/vnc(/|$)(.*)");
        assert_eq!(paths[2]["backend"]["service"]["port"]["number"], 5901);
        assert_eq!(ing.manifest["spec"]["rules"][0]["host"], "vnc.service.thinkgs.cn");
    }
}
