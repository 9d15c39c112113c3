use std::path::PathBuf;
use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{self, Settings};
use crate::core::{App, LogEntry};
use crate::store::RecentConfig;
use crate::LOGGING_FILE;

#[derive(Deserialize)]
struct PathRequest {
    path: String,
}

#[derive(Deserialize)]
struct ExportRequest {
    path: String,
    settings: Settings,
}

#[get("/state")]
fn get_state(app: &State<Arc<App>>) -> Json<Value> {
    return Json(app.state_json());
}

#[post("/start", data = "<settings>")]
async fn start(app: &State<Arc<App>>, settings: Json<Settings>) -> Json<Value> {
    return Json(match app.start_tunnel(settings.into_inner()).await {
        Ok(()) => json!({ "ok": true }),
        Err(errors) => json!({ "ok": false, "errors": errors }),
    });
}

#[post("/stop")]
async fn stop(app: &State<Arc<App>>) -> Json<Value> {
    // The grace period can hold this for two seconds; keep it off the
    // executor threads.
    let app = app.inner().clone();
    let _ = rocket::tokio::task::spawn_blocking(move || app.stop_tunnel()).await;
    return Json(json!({ "ok": true }));
}

#[get("/logs")]
fn get_logs(app: &State<Arc<App>>) -> Json<Vec<LogEntry>> {
    return Json(app.logs());
}

#[post("/logs/clear")]
fn clear_logs(app: &State<Arc<App>>) -> Json<Value> {
    app.clear_logs();
    return Json(json!({ "ok": true }));
}

#[get("/recent")]
async fn get_recent(app: &State<Arc<App>>) -> Json<Vec<RecentConfig>> {
    return Json(app.recent().await);
}

#[post("/recent/apply?<id>")]
async fn apply_recent(app: &State<Arc<App>>, id: i64) -> Json<Value> {
    return Json(match app.apply_recent(id).await {
        Ok(settings) => json!({ "ok": true, "settings": settings }),
        Err(error) => json!({ "ok": false, "error": error }),
    });
}

#[post("/import", data = "<request>")]
async fn import(app: &State<Arc<App>>, request: Json<PathRequest>) -> Json<Value> {
    return Json(
        match app.import_config(&PathBuf::from(&request.path)).await {
            Ok(settings) => json!({ "ok": true, "settings": settings }),
            Err(error) => json!({ "ok": false, "error": error }),
        },
    );
}

#[post("/export", data = "<request>")]
async fn export(app: &State<Arc<App>>, request: Json<ExportRequest>) -> Json<Value> {
    let request = request.into_inner();
    return Json(
        match app
            .export_config(&PathBuf::from(&request.path), &request.settings)
            .await
        {
            Ok(()) => json!({ "ok": true }),
            Err(error) => json!({ "ok": false, "error": error }),
        },
    );
}

#[get("/key")]
fn get_key() -> Json<Value> {
    return Json(json!({ "key": config::generate_secret_key() }));
}

#[get("/interfaces")]
fn get_interfaces() -> Json<Value> {
    let mut interfaces: Vec<Value> = vec![];
    if let Ok(list) = local_ip_address::list_afinet_netifas() {
        for (name, address) in list.into_iter() {
            if address.is_loopback() {
                continue;
            }
            interfaces.push(json!({ "name": name, "address": address.to_string() }));
        }
    }
    return Json(json!(interfaces));
}

#[get("/settings")]
async fn get_settings(app: &State<Arc<App>>) -> Json<Value> {
    return Json(app.db.get("form_vars", json!({})).await);
}

#[post("/settings", data = "<settings>")]
async fn set_settings(app: &State<Arc<App>>, settings: Json<Value>) -> Json<Value> {
    app.db.set("form_vars", &settings.into_inner()).await;
    return Json(json!({ "ok": true }));
}

#[post("/binary", data = "<request>")]
async fn set_binary(app: &State<Arc<App>>, request: Json<PathRequest>) -> Json<Value> {
    let path = PathBuf::from(&request.path);
    if !app.set_binary_path(path.clone()) {
        return Json(json!({ "ok": false, "error": "no such file" }));
    }
    app.db.set("binary_path", &json!(request.path)).await;
    return Json(json!({ "ok": true }));
}

#[get("/meta")]
fn get_meta() -> Json<Value> {
    return Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "target_os": std::env::consts::OS,
        "target_arch": std::env::consts::ARCH,
    }));
}

#[get("/log")]
fn download_log() -> Option<std::fs::File> {
    return std::fs::File::open((*LOGGING_FILE).clone()).ok();
}

pub fn rocket(app: App) -> Rocket<Build> {
    return rocket::custom(rocket::Config {
        log_level: rocket::log::LogLevel::Critical,
        port: if cfg!(debug_assertions) { 8080 } else { 0 },
        ..rocket::Config::default()
    })
    .manage(Arc::new(app))
    .mount(
        "/",
        routes![
            get_state,
            start,
            stop,
            get_logs,
            clear_logs,
            get_recent,
            apply_recent,
            import,
            export,
            get_key,
            get_interfaces,
            get_settings,
            set_settings,
            set_binary,
            get_meta,
            download_log,
        ],
    );
}

pub async fn server_main(data_dir: PathBuf) {
    let app = App::new(data_dir).await;

    let _ = rocket(app)
        .attach(rocket::fairing::AdHoc::on_liftoff("Announce", |rocket| {
            Box::pin(async move {
                let port = rocket.config().port;
                logging!(
                    ":",
                    "{}",
                    json!({
                        "version": 1,
                        "url": format!("http://127.0.0.1:{}/", port)}
                    )
                );
            })
        }))
        .launch()
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;

    async fn client() -> (tempfile::TempDir, Client) {
        let dir = tempfile::tempdir().unwrap();
        let app = App::for_tests(dir.path().to_path_buf()).await;
        let client = Client::tracked(rocket(app)).await.unwrap();
        return (dir, client);
    }

    #[rocket::async_test]
    async fn state_starts_stopped() {
        let (_dir, client) = client().await;

        let response = client.get("/state").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["state"], "stopped");
    }

    #[rocket::async_test]
    async fn key_route_returns_64_hex_chars() {
        let (_dir, client) = client().await;

        let body: Value = client
            .get("/key")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        let key = body["key"].as_str().unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[rocket::async_test]
    async fn start_with_empty_settings_reports_errors() {
        let (_dir, client) = client().await;

        let body: Value = client
            .post("/start")
            .header(ContentType::JSON)
            .body("{}")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();

        assert_eq!(body["ok"], false);
        assert!(!body["errors"].as_array().unwrap().is_empty());
    }

    #[rocket::async_test]
    async fn stop_without_a_session_is_ok() {
        let (_dir, client) = client().await;

        let body: Value = client
            .post("/stop")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[rocket::async_test]
    async fn settings_round_trip_through_the_store() {
        let (_dir, client) = client().await;

        let response = client
            .post("/settings")
            .header(ContentType::JSON)
            .body(r#"{"role":"server","listen_port":"7000"}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let body: Value = client
            .get("/settings")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["role"], "server");
        assert_eq!(body["listen_port"], "7000");
    }

    #[rocket::async_test]
    async fn recent_list_starts_empty() {
        let (_dir, client) = client().await;

        let body: Value = client
            .get("/recent")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body, json!([]));
    }

    #[rocket::async_test]
    async fn export_then_apply_recent() {
        let (dir, client) = client().await;
        let path = dir.path().join("exported.yaml");

        let request = json!({
            "path": path.to_string_lossy(),
            "settings": {
                "interface": "eth0",
                "guid": "{deadbeef}",
                "router_mac": "aa:bb:cc:dd:ee:ff",
                "kcp_key": "secret",
                "server_ip": "10.0.0.1",
            },
        });
        let body: Value = client
            .post("/export")
            .header(ContentType::JSON)
            .body(request.to_string())
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);

        let recent: Value = client
            .get("/recent")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        let id = recent[0]["id"].as_i64().unwrap();

        let body: Value = client
            .post(format!("/recent/apply?id={}", id))
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["settings"]["server_ip"], "10.0.0.1");
    }

    #[rocket::async_test]
    async fn binary_route_rejects_missing_files() {
        let (_dir, client) = client().await;

        let body: Value = client
            .post("/binary")
            .header(ContentType::JSON)
            .body(r#"{"path":"/nonexistent/paqet"}"#)
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["ok"], false);
    }

    #[rocket::async_test]
    async fn meta_reports_the_version() {
        let (_dir, client) = client().await;

        let body: Value = client
            .get("/meta")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
