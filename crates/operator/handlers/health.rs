use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};
use varnish_cluster::util::state::State;

#[get("/health")]
pub async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
pub async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn health_and_diagnostics_respond() {
        let state = State::new("varnish-controller");
        state.diagnostics_handle().write().await.active_vcl = Some("v-3-1700000000".to_string());
        let app = test::init_service(App::new().app_data(Data::new(state)).service(health).service(index)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(body["active_vcl"], "v-3-1700000000");
    }
}
