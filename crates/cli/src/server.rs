//! HTTP tile server: one route, `GET /{z}/{x}/{y}.mvt`.

use actix_web::{middleware, web, App, HttpResponse, HttpServer};

use tilery_core::render::{make_render_ctx, render_tile, RenderCtx};
use tilery_core::store::Store;
use tilery_core::tile::TileCoord;
use tilery_core::Z_MAX;

struct AppState {
    store: Store,
    ctx: RenderCtx,
}

async fn get_tile(
    path: web::Path<(u8, u32, u32)>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (z, x, y) = path.into_inner();
    if z > Z_MAX || x >= (1u32 << z.min(31)) || y >= (1u32 << z.min(31)) {
        return HttpResponse::BadRequest().body("tile coordinates out of range");
    }
    let tile = TileCoord::new(x, y, z);

    match render_tile(&state.store, &state.ctx, tile) {
        Ok(bytes) => {
            log::debug!("served {z}/{x}/{y}.mvt ({} bytes)", bytes.len());
            HttpResponse::Ok()
                .content_type("application/vnd.mapbox-vector-tile")
                .body(bytes)
        }
        Err(e) => {
            log::error!("failed to render {z}/{x}/{y}: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub fn serve(store: Store, port: u16) -> std::io::Result<()> {
    actix_web::rt::System::new().block_on(async move {
        let ctx = make_render_ctx(&store)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let state = web::Data::new(AppState { store, ctx });

        log::info!("serving tiles on http://0.0.0.0:{port}");
        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(middleware::DefaultHeaders::new().add(("Access-Control-Allow-Origin", "*")))
                .route("/{z}/{x}/{y}.mvt", web::get().to(get_tile))
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    })
}
