mod common;

use axum::http::{Method, StatusCode};
use common::{CountingProvider, GatedReasoner, TestApp};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn projects_agents_and_tasks_are_scoped_to_their_owner() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let (status, project) = app
        .request(
            Method::POST,
            "/api/projects",
            Some(owner),
            Some(json!({ "name": "Docs", "description": null })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["data"]["id"].as_str().unwrap().to_string();

    let (status, agent) = app
        .request(
            Method::POST,
            "/api/agents",
            Some(owner),
            Some(json!({ "name": "Scribe", "role": "writer", "description": null })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let agent_id = agent["data"]["id"].as_str().unwrap().to_string();

    let tasks_uri = format!("/api/projects/{project_id}/tasks");
    let (status, task) = app
        .request(
            Method::POST,
            &tasks_uri,
            Some(owner),
            Some(json!({ "title": "Draft intro", "description": null, "assignee_ids": [agent_id] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["data"]["status"], "PENDING");
    assert_eq!(task["data"]["assignees"][0]["name"], "Scribe");

    let (status, listed) = app.request(Method::GET, &tasks_uri, Some(owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let (status, _) = app.request(Method::GET, &tasks_uri, Some(stranger), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, projects) = app
        .request(Method::GET, "/api/projects", Some(stranger), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(projects["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn tasks_reject_agents_the_caller_does_not_own() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let owner = Uuid::new_v4();
    let (project, task) = app.seed(owner, 1).await;
    let (_, foreign_task) = app.seed(Uuid::new_v4(), 1).await;
    let foreign_agent = db::models::task::Task::assignees(
        &deployment_pool(&app),
        foreign_task.id,
    )
    .await
    .unwrap()[0]
        .id;

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/api/projects/{}/tasks", project.id),
            Some(owner),
            Some(json!({ "title": "x", "description": null, "assignee_ids": [foreign_agent] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request(
            Method::PUT,
            &format!("/api/tasks/{}/assignees", task.id),
            Some(owner),
            Some(json!({ "assignee_ids": [foreign_agent] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .request(
            Method::PUT,
            &format!("/api/tasks/{}/assignees", task.id),
            Some(owner),
            Some(json!({ "assignee_ids": [] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn in_progress_cannot_be_set_by_hand() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let owner = Uuid::new_v4();
    let (_, task) = app.seed(owner, 1).await;

    let (status, _) = app
        .request(
            Method::PUT,
            &format!("/api/tasks/{}", task.id),
            Some(owner),
            Some(json!({ "status": "IN_PROGRESS" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::new(CountingProvider::default(), GatedReasoner::open()).await;
    let response = tower::ServiceExt::oneshot(
        app.router.clone(),
        axum::http::Request::builder()
            .uri("/api/health")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

fn deployment_pool(app: &TestApp) -> sqlx::SqlitePool {
    use deployment::Deployment;
    app.deployment.db().pool.clone()
}
